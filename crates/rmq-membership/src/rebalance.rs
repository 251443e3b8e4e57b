use std::collections::BTreeMap;

/// client id -> owned virtual queues, both sorted.
pub type Assignment = BTreeMap<String, Vec<String>>;

/// Partition `virtual_queues` across `live_clients`.
///
/// Clients and queues are sorted (and deduplicated) first; the queue at
/// sorted index `i` goes to the client at index `i mod n`. The result depends
/// only on the two sets, never on input order.
pub fn assign_all(live_clients: &[String], virtual_queues: &[String]) -> Assignment {
    let clients = sorted_unique(live_clients);
    let queues = sorted_unique(virtual_queues);

    let mut assignment: Assignment = clients.iter().map(|c| (c.clone(), Vec::new())).collect();
    if clients.is_empty() {
        return assignment;
    }

    for (i, queue) in queues.into_iter().enumerate() {
        let owner = &clients[i % clients.len()];
        if let Some(owned) = assignment.get_mut(owner) {
            owned.push(queue);
        }
    }
    assignment
}

/// The virtual queues `self_id` owns. Empty when `self_id` is not live.
pub fn rebalance(live_clients: &[String], virtual_queues: &[String], self_id: &str) -> Vec<String> {
    assign_all(live_clients, virtual_queues)
        .remove(self_id)
        .unwrap_or_default()
}

fn sorted_unique(items: &[String]) -> Vec<String> {
    let mut items = items.to_vec();
    items.sort();
    items.dedup();
    items
}
