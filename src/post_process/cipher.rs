use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine, engine::general_purpose::STANDARD};

use crate::downloader::error::DownloadError;
use crate::downloader::models::{CipherAlgorithm, SubtitleCipherSpec};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// 逐行解密字幕文本：base64 -> AES-CBC -> PKCS#7 去填充 -> UTF-8
#[derive(Debug, Clone)]
pub struct SubtitleDecryptor {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl SubtitleDecryptor {
    pub fn new(spec: &SubtitleCipherSpec) -> Result<Self, DownloadError> {
        match spec.algorithm {
            CipherAlgorithm::AesCbc => {}
        }
        let key = spec.key.as_bytes().to_vec();
        let iv = spec.iv.as_bytes().to_vec();
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(DownloadError::SubtitleError(format!(
                "AES 密钥长度无效: {} 字节",
                key.len()
            )));
        }
        if iv.len() != 16 {
            return Err(DownloadError::SubtitleError(format!(
                "IV 长度无效: {} 字节",
                iv.len()
            )));
        }
        Ok(Self { key, iv })
    }

    pub fn decrypt_line(&self, line: &str) -> Result<String, DownloadError> {
        let mut buf = STANDARD
            .decode(line.trim())
            .map_err(|e| DownloadError::SubtitleError(format!("base64 解码失败: {e}")))?;

        let plain = match self.key.len() {
            16 => Aes128CbcDec::new_from_slices(&self.key, &self.iv)
                .map_err(invalid_length)?
                .decrypt_padded_mut::<Pkcs7>(&mut buf),
            24 => Aes192CbcDec::new_from_slices(&self.key, &self.iv)
                .map_err(invalid_length)?
                .decrypt_padded_mut::<Pkcs7>(&mut buf),
            _ => Aes256CbcDec::new_from_slices(&self.key, &self.iv)
                .map_err(invalid_length)?
                .decrypt_padded_mut::<Pkcs7>(&mut buf),
        }
        .map_err(|_| DownloadError::SubtitleError("填充校验失败".to_string()))?;

        let text = std::str::from_utf8(plain)
            .map_err(|e| DownloadError::SubtitleError(format!("解密结果不是 UTF-8: {e}")))?;
        Ok(text.trim().to_string())
    }
}

fn invalid_length(e: aes::cipher::InvalidLength) -> DownloadError {
    DownloadError::SubtitleError(format!("密钥或 IV 长度无效: {e}"))
}
