use std::collections::BTreeMap;

use fleet_core::Priority;

/// 工作项类型到优先级的查找表，配置中的条目覆盖内置默认值
#[derive(Debug, Clone, Default)]
pub struct PriorityTable {
    overrides: BTreeMap<String, Priority>,
}

impl PriorityTable {
    pub fn new(overrides: BTreeMap<String, Priority>) -> Self {
        Self { overrides }
    }

    pub fn priority_for(&self, item_type: &str) -> Priority {
        self.overrides
            .get(item_type)
            .copied()
            .unwrap_or_else(|| default_priority(item_type))
    }
}

/// 内置优先级：未列出的类型为 medium
fn default_priority(item_type: &str) -> Priority {
    match item_type {
        "urgent" | "config_sync" | "health_check" => Priority::High,
        "batch" | "background" | "cleanup" => Priority::Low,
        _ => Priority::Medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        let table = PriorityTable::default();
        assert_eq!(table.priority_for("urgent"), Priority::High);
        assert_eq!(table.priority_for("cleanup"), Priority::Low);
        assert_eq!(table.priority_for("analysis"), Priority::Medium);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut overrides = BTreeMap::new();
        overrides.insert("cleanup".to_string(), Priority::High);
        overrides.insert("report".to_string(), Priority::Low);
        let table = PriorityTable::new(overrides);

        assert_eq!(table.priority_for("cleanup"), Priority::High);
        assert_eq!(table.priority_for("report"), Priority::Low);
        assert_eq!(table.priority_for("urgent"), Priority::High);
    }
}
