//! # 缓存指纹工具
//!
//! 所有缓存键都由 SHA-256 十六进制指纹派生

use sha2::{Digest, Sha256};

/// 计算字节串的 SHA-256 十六进制指纹
#[must_use]
pub fn make_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 构建 Embedding 缓存指纹
///
/// 规范化拼接 `input_text|model_name`，可选 dimensions 追加 `|<dims>`，
/// 保证同一输入在不同模型或维度下互不冲突
#[must_use]
pub fn embedding_cache_key(input_text: &str, model_name: &str, dimensions: Option<i32>) -> String {
    let key = match dimensions {
        Some(dims) => format!("{input_text}|{model_name}|{dims}"),
        None => format!("{input_text}|{model_name}"),
    };
    make_hash(key.as_bytes())
}

/// 构建 LLM 缓存指纹
///
/// 直接对客户端发送的原始请求体字节取哈希，任何空白或字段顺序差异都视为不同请求
#[must_use]
pub fn llm_cache_key(raw_body: &[u8]) -> String {
    make_hash(raw_body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_hash_is_deterministic() {
        let a = make_hash(b"hello");
        let b = make_hash(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, make_hash(b"hello "));
    }

    #[test]
    fn test_embedding_cache_key_varies_by_model() {
        let a = embedding_cache_key("hello", "text-emb-a", None);
        let b = embedding_cache_key("hello", "text-emb-b", None);
        assert_ne!(a, b);
        assert_eq!(a, embedding_cache_key("hello", "text-emb-a", None));
    }

    #[test]
    fn test_embedding_cache_key_varies_by_dimensions() {
        let a = embedding_cache_key("hello", "text-emb-a", None);
        let b = embedding_cache_key("hello", "text-emb-a", Some(512));
        let c = embedding_cache_key("hello", "text-emb-a", Some(256));
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_embedding_key_separator_prevents_collisions() {
        // "ab" + "c" 与 "a" + "bc" 必须不同
        let a = embedding_cache_key("ab", "c", None);
        let b = embedding_cache_key("a", "bc", None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_llm_cache_key_is_byte_exact() {
        let a = llm_cache_key(br#"{"model":"gpt-4"}"#);
        let b = llm_cache_key(br#"{"model": "gpt-4"}"#);
        assert_ne!(a, b);
    }
}
