use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{info, warn};

use crate::delivery::PendingDelivery;
use crate::AppState;

/// App-server notification intake: `PUT <notifyPrefix><id>` where `<id>`
/// names a channel or a group. Each target channel's version is bumped by
/// one and handed to the delivery engine.
pub async fn notify_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(id): Path<String>,
) -> Response {
    if method != Method::PUT {
        return (StatusCode::BAD_REQUEST, "method must be PUT\n").into_response();
    }
    if id.is_empty() || id.contains('/') {
        return (
            StatusCode::BAD_REQUEST,
            "not a valid channelID or groupID\n",
        )
            .into_response();
    }

    let deliveries = {
        let mut registry = state.registry().write().await;
        let targets: Vec<String> = if registry.has_channel(&id) {
            vec![id.clone()]
        } else if let Some(members) = registry.group_members(&id) {
            members
        } else {
            warn!(event = "notify_unknown_id", id = %id);
            return (StatusCode::NOT_FOUND, "unknown channelID or groupID\n").into_response();
        };

        // stale group members no longer in the channel table are skipped here
        let mut deliveries = Vec::new();
        for channel_id in targets {
            if let Some((uaid, version)) = registry.bump_version(&channel_id) {
                deliveries.push(PendingDelivery {
                    uaid,
                    channel_id,
                    version,
                });
            }
        }
        deliveries
    };

    info!(event = "notify_accepted", id = %id, targets = deliveries.len());
    for delivery in deliveries {
        state.delivery().submit(delivery);
    }
    state.snapshot().await;

    (StatusCode::OK, "OK").into_response()
}

/// Group membership admin: `POST <groupPrefix>/<add|remove>/<groupID>` with
/// a push endpoint URL as the body. Replies with the group's own notify
/// endpoint on success.
pub async fn group_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(rest): Path<String>,
    body: String,
) -> Response {
    if method != Method::POST {
        return (StatusCode::BAD_REQUEST, "method must be POST\n").into_response();
    }
    let Some((action, group_id)) = split_group_path(&rest) else {
        return (
            StatusCode::BAD_REQUEST,
            "expected <groupPrefix>/<add|remove>/<groupID>\n",
        )
            .into_response();
    };
    let Some(channel_id) = state.config().channel_id_from_endpoint(body.trim()) else {
        return (
            StatusCode::BAD_REQUEST,
            "body must be a push endpoint URL\n",
        )
            .into_response();
    };

    {
        let mut registry = state.registry().write().await;
        if !registry.has_channel(&channel_id) {
            return (StatusCode::BAD_REQUEST, "unknown channelID\n").into_response();
        }
        match action {
            "add" => registry.group_add(group_id, &channel_id),
            "remove" => registry.group_remove(group_id, &channel_id),
            _ => {
                return (
                    StatusCode::BAD_REQUEST,
                    "action must be add or remove\n",
                )
                    .into_response();
            }
        }
    }

    info!(event = "group_updated", group_id = %group_id, action = %action, channel_id = %channel_id);
    state.snapshot().await;

    (StatusCode::OK, state.config().endpoint_url(group_id)).into_response()
}

/// Split the wildcard remainder of a group URL into (action, groupID).
fn split_group_path(rest: &str) -> Option<(&str, &str)> {
    let mut parts = rest.split('/').filter(|part| !part.is_empty());
    let action = parts.next()?;
    let group_id = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((action, group_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_path_splits_action_and_group() {
        assert_eq!(split_group_path("add/g1"), Some(("add", "g1")));
        assert_eq!(split_group_path("remove/team-7"), Some(("remove", "team-7")));
    }

    #[test]
    fn group_path_rejects_missing_or_extra_segments() {
        assert_eq!(split_group_path("add"), None);
        assert_eq!(split_group_path(""), None);
        assert_eq!(split_group_path("add/g1/extra"), None);
    }
}
