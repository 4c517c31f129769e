use std::collections::BTreeSet;

use fleet_core::Node;

/// 按能力路由：在能力满足要求的健康节点中选择负载最低的，负载相同时选择 id 最小的
pub fn select_least_loaded<'a, I>(nodes: I, required: &BTreeSet<String>) -> Option<&'a Node>
where
    I: IntoIterator<Item = &'a Node>,
{
    nodes
        .into_iter()
        .filter(|node| node.is_healthy() && node.has_capabilities(required))
        .min_by(|a, b| {
            a.load
                .active_item_count
                .cmp(&b.load.active_item_count)
                .then_with(|| a.id.cmp(&b.id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{NodeDescriptor, NodeRole, NodeStatus};

    fn node(id: &str, caps: &[&str], load: u32, status: NodeStatus) -> Node {
        let mut node = Node::new(NodeDescriptor::new(
            id,
            "http://127.0.0.1:1",
            NodeRole::Full,
            caps.iter().copied(),
        ));
        node.load.active_item_count = load;
        node.status = status;
        node
    }

    fn caps(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_picks_lowest_load_among_capable() {
        let nodes = vec![
            node("a", &["heavy_compute"], 5, NodeStatus::Healthy),
            node("b", &["heavy_compute", "light_requests"], 2, NodeStatus::Healthy),
            node("c", &["light_requests"], 0, NodeStatus::Healthy),
        ];

        let selected = select_least_loaded(&nodes, &caps(&["heavy_compute"])).unwrap();
        assert_eq!(selected.id, "b");
    }

    #[test]
    fn test_tie_broken_by_lowest_id() {
        let nodes = vec![
            node("zeta", &[], 1, NodeStatus::Healthy),
            node("alpha", &[], 1, NodeStatus::Healthy),
        ];
        assert_eq!(select_least_loaded(&nodes, &caps(&[])).unwrap().id, "alpha");
    }

    #[test]
    fn test_unhealthy_and_incapable_are_skipped() {
        let nodes = vec![
            node("a", &["gpu"], 0, NodeStatus::Unhealthy),
            node("b", &[], 0, NodeStatus::Healthy),
        ];
        assert!(select_least_loaded(&nodes, &caps(&["gpu"])).is_none());
    }
}
