use std::time::Duration;

pub fn timestamp() -> String {
    chrono::Local::now().format("%F %T").to_string()
}

/// `MMm SSs`，超过一小时为 `HHh MMm SSs`
pub fn pretty_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{h:02}h {m:02}m {s:02}s")
    } else {
        format!("{m:02}m {s:02}s")
    }
}

/// 进度条上显示的短名称："Show Episode 5 - 720P.mp4" -> "Episode-05"
pub fn shortened_episode_name(output_file_name: &str) -> String {
    let tokens: Vec<&str> = output_file_name.split_whitespace().collect();
    if tokens.len() < 3 {
        return "Movie".to_string();
    }
    let token = tokens[tokens.len() - 3];
    match token.parse::<u32>() {
        Ok(n) => format!("Episode-{n:02}"),
        Err(_) if token.eq_ignore_ascii_case("movie") => "Movie".to_string(),
        Err(_) => format!("Episode-{token}"),
    }
}

/// 去掉查询参数与不适合做文件名的字符
pub fn sanitize_file_name(name: &str) -> String {
    let name = name.split(['?', '#']).next().unwrap_or_default();
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
