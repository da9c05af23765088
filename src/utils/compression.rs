//! # 响应体压缩工具

use axum::http::HeaderMap;
use flate2::read::GzDecoder;
use std::io::Read;

/// 响应头是否声明 gzip 编码
#[must_use]
pub fn is_gzip_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|encoding| encoding.to_ascii_lowercase().contains("gzip"))
}

/// 解压 gzip 字节，失败时返回 IO 错误
pub fn decompress_gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(body);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}
