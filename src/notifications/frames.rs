//! Frames the client sends over the notification channel

use serde_json::json;
use uuid::Uuid;

use crate::notifications::stomp::Frame;

/// STOMP-level handshake. The backend checks the bearer token here, not at
/// the websocket upgrade.
pub fn connect_frame(token: &str, heartbeat_millis: u64) -> Frame {
    Frame::new(
        "CONNECT",
        vec![
            ("accept-version".to_string(), "1.1,1.2".to_string()),
            (
                "heart-beat".to_string(),
                format!("{},{}", heartbeat_millis, heartbeat_millis),
            ),
            ("Authorization".to_string(), format!("Bearer {}", token)),
        ],
        None,
    )
}

/// Subscribe to the per-family notification topic.
pub fn subscribe_frame(subscription_id: Uuid, user_id: i64, family_id: i64) -> Frame {
    Frame::new(
        "SUBSCRIBE",
        vec![
            ("id".to_string(), subscription_id.to_string()),
            (
                "destination".to_string(),
                format!("/notification/{}/{}", user_id, family_id),
            ),
            ("ack".to_string(), "auto".to_string()),
        ],
        None,
    )
}

pub fn unsubscribe_frame(subscription_id: Uuid) -> Frame {
    Frame::new(
        "UNSUBSCRIBE",
        vec![("id".to_string(), subscription_id.to_string())],
        None,
    )
}

/// Ask the backend to push fresh state for one unit.
pub fn refresh_frame(token: &str, user_id: i64, family_id: i64, rac_id: i64) -> Frame {
    request_frame(token, user_id, family_id, rac_id, "REFRESH_INDIVIDUAL")
}

/// Ask the backend to push fresh state for every unit of the family.
pub fn refresh_all_frame(token: &str, user_id: i64, family_id: i64) -> Frame {
    request_frame(token, user_id, family_id, 0, "REFRESH_ALL")
}

fn request_frame(
    token: &str,
    user_id: i64,
    family_id: i64,
    rac_id: i64,
    request_type: &str,
) -> Frame {
    Frame::new(
        "MESSAGE",
        vec![
            (
                "destination".to_string(),
                format!("/app/racs/{}/{}", user_id, family_id),
            ),
            ("Authorization".to_string(), format!("Bearer {}", token)),
        ],
        Some(json!({
            "racId": rac_id,
            "requestType": request_type,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_frame_carries_token_and_heartbeat() {
        let frame = connect_frame("tok123", 10_000);
        assert_eq!(frame.command, "CONNECT");
        assert_eq!(frame.header("accept-version"), Some("1.1,1.2"));
        assert_eq!(frame.header("heart-beat"), Some("10000,10000"));
        assert_eq!(frame.header("Authorization"), Some("Bearer tok123"));
        assert!(frame.body.is_none());
    }

    #[test]
    fn test_subscribe_destination_embeds_user_and_family() {
        let id = Uuid::new_v4();
        let frame = subscribe_frame(id, 11, 42);
        assert_eq!(frame.header("destination"), Some("/notification/11/42"));
        assert_eq!(frame.header("id"), Some(id.to_string().as_str()));
        assert_eq!(frame.header("ack"), Some("auto"));
    }

    #[test]
    fn test_refresh_frames_differ_only_in_request_type() {
        let one = refresh_frame("t", 11, 42, 7);
        let all = refresh_all_frame("t", 11, 42);

        assert_eq!(one.header("destination"), Some("/app/racs/11/42"));
        assert_eq!(
            one.body,
            Some(json!({"racId": 7, "requestType": "REFRESH_INDIVIDUAL"}))
        );
        assert_eq!(
            all.body,
            Some(json!({"racId": 0, "requestType": "REFRESH_ALL"}))
        );
    }
}
