use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::NodeId;
use crate::checksum::sha256_hex;
use crate::errors::{FleetError, FleetResult};

/// 版本化的配置包，一经创建不可修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigBundle {
    pub version: String,
    pub content: Vec<u8>,
    /// content 的 SHA-256 小写十六进制
    pub checksum: String,
    pub source_node: NodeId,
    pub created_at: DateTime<Utc>,
}

impl ConfigBundle {
    pub fn new(version: &str, content: Vec<u8>, source_node: &str) -> Self {
        let checksum = sha256_hex(&content);
        Self {
            version: version.to_string(),
            content,
            checksum,
            source_node: source_node.to_string(),
            created_at: Utc::now(),
        }
    }

    /// 检查必填字段
    pub fn validate(&self) -> FleetResult<()> {
        if self.version.trim().is_empty() {
            return Err(FleetError::InvalidBundle("版本号不能为空".to_string()));
        }
        if self.checksum.trim().is_empty() {
            return Err(FleetError::InvalidBundle("校验和不能为空".to_string()));
        }
        if self.source_node.trim().is_empty() {
            return Err(FleetError::InvalidBundle("来源节点不能为空".to_string()));
        }
        Ok(())
    }

    /// 重新计算内容校验和并与携带的校验和比较
    pub fn verify_checksum(&self) -> FleetResult<()> {
        let actual = sha256_hex(&self.content);
        if !actual.eq_ignore_ascii_case(&self.checksum) {
            return Err(FleetError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    pub fn is_newer_than(&self, version: &str) -> bool {
        compare_versions(&self.version, version) == Ordering::Greater
    }
}

/// 自然排序比较版本号：数字段按数值比较，其余按字符比较
///
/// `v10` > `v9`，`20240101000000000` > `20231231235959999`
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let ln = take_digits(&mut left);
                let rn = take_digits(&mut right);
                let ordering = compare_digit_runs(&ln, &rn);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(l), Some(r)) => {
                if l != r {
                    return l.cmp(&r);
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    digits
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// 基于时间生成版本号，格式 `YYYYMMDDhhmmssSSS`
pub fn default_version(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S%3f").to_string()
}

/// 客户端注册信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientRegistration {
    pub node: NodeId,
    pub registered_at: DateTime<Utc>,
    pub last_applied_version: Option<String>,
    pub consecutive_failure_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl ClientRegistration {
    pub fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            registered_at: Utc::now(),
            last_applied_version: None,
            consecutive_failure_count: 0,
            last_attempt_at: None,
        }
    }

    pub fn record_success(&mut self, version: &str, at: DateTime<Utc>) {
        self.last_applied_version = Some(version.to_string());
        self.consecutive_failure_count = 0;
        self.last_attempt_at = Some(at);
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.consecutive_failure_count += 1;
        self.last_attempt_at = Some(at);
    }
}

/// 单次下发尝试的记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionRecord {
    pub node: NodeId,
    pub version: String,
    pub success: bool,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}
