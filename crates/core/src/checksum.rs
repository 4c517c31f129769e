use sha2::{Digest, Sha256};

/// SHA-256 小写十六进制
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// 工作项负载的摘要，审计事件中只记录摘要不记录原文
pub fn payload_digest(payload: &serde_json::Value) -> String {
    sha256_hex(payload.to_string().as_bytes())
}
