//! Broadcast-and-collect

use std::time::Duration;

use futures_util::future::join_all;
use tokio::time;

use super::{GroupManager, GroupMessage, TransportError, TransportResult};
use crate::model::NodeId;

/// Sends `message` to every node in `nodes` concurrently and collects each
/// reply, bounding every wait by `timeout`.
///
/// One slow or dead peer delays the result by at most `timeout` and never
/// affects the replies of the others. Results keep the order of `nodes`.
pub async fn send_all_and_wait(
    group: &dyn GroupManager,
    nodes: &[NodeId],
    message: &GroupMessage,
    timeout: Duration,
) -> Vec<(NodeId, TransportResult<GroupMessage>)> {
    let requests = nodes.iter().map(|node| {
        let node = *node;
        let message = message.clone();
        async move {
            let reply = match time::timeout(timeout, group.send_to_and_wait(node, message)).await {
                Ok(reply) => reply,
                Err(_) => Err(TransportError::Timeout(node)),
            };
            (node, reply)
        }
    });
    join_all(requests).await
}
