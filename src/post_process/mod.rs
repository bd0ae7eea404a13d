pub mod cipher;
pub mod merger;
pub mod subtitles;
