/// Build a node identity of the form `<hostname>-<suffix>`
///
/// Only used as a human-readable label in logs. The scatter-gather protocol
/// tags its own messages with a fresh UUID per process.
#[must_use]
pub fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}
