//! Shutdown procedure closing every socket held by this node

use pushline_core::models::{PusherMessage, DRAIN_CODE};
use tracing::{debug, info, warn};

use crate::adapter::Adapter;

const DRAIN_REASON: &str = "Server closed. Please reconnect shortly.";

/// Tell every local socket to reconnect elsewhere, then empty the registry
///
/// Peers are not involved; their sockets stay untouched. Returns the number
/// of sockets closed.
pub async fn drain_local_sockets(adapter: &dyn Adapter) -> usize {
    let notice = match PusherMessage::drain_notice().to_json() {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "Failed to encode drain notice, closing without it");
            None
        }
    };

    let mut closed = 0;
    for app_id in adapter.namespace_ids() {
        let sockets = adapter.local_sockets(&app_id);
        debug!(%app_id, sockets = sockets.len(), "Draining namespace");

        for socket in sockets {
            if let Some(frame) = &notice {
                socket.send_raw(frame);
            }
            socket.close(DRAIN_CODE, DRAIN_REASON);
            adapter.remove_socket(&app_id, &socket.id).await;
            closed += 1;
        }
        adapter.clear_namespace(&app_id).await;
    }
    adapter.clear_namespaces().await;

    info!(closed, "Drained local sockets");
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LocalAdapter;
    use pushline_core::models::{Outbound, Socket};

    #[tokio::test]
    async fn test_drain_closes_and_clears() {
        let adapter = LocalAdapter::new();
        let (first, mut first_rx) = Socket::with_channel("1.1", "app-a");
        let (second, mut second_rx) = Socket::with_channel("1.2", "app-b");
        adapter.add_to_channel("app-a", "chat", &first);
        adapter.add_to_channel("app-b", "news", &second);

        assert_eq!(drain_local_sockets(&adapter).await, 2);

        for rx in [&mut first_rx, &mut second_rx] {
            let Some(Outbound::Message(notice)) = rx.recv().await else {
                panic!("expected drain notice");
            };
            assert!(notice.contains("4200"));
            assert_eq!(
                rx.recv().await,
                Some(Outbound::Close {
                    code: DRAIN_CODE,
                    reason: DRAIN_REASON.to_string()
                })
            );
        }
        assert!(adapter.namespace_ids().is_empty());
        assert_eq!(adapter.sockets_count("app-a"), 0);
    }
}
