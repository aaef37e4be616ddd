//! Wire protocol for the relay / extension duplex socket.
//!
//! Every frame is a JSON text message with a mandatory `type` discriminator;
//! command payloads carry a second `kind` discriminator for the action. Field
//! names are camelCase on the wire.
//!
//! Unknown `type` tags are tolerated by the reader (logged and ignored at the
//! hub), but unknown action `kind`s fail deserialization, so the REST boundary
//! rejects them before anything reaches a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames sent by the relay to the extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Handshake acknowledgement, the first frame on every new session.
    ConnectAck {
        /// Fresh session id.
        session_id: String,
        /// Server wall clock in milliseconds since the epoch.
        server_time: i64,
        /// Relay version string.
        server_version: String,
    },
    /// Pre-upgrade (or handshake) rejection.
    ConnectError {
        /// Machine-readable rejection code.
        code: ConnectErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// Liveness probe; the extension answers with a `pong` frame.
    Ping {
        /// Server wall clock in milliseconds since the epoch.
        timestamp: i64,
    },
    /// A command to execute against one tab.
    Command {
        /// Correlation id echoed by the response.
        id: String,
        /// Target tab.
        tab_id: String,
        /// Time the extension has to answer, in milliseconds.
        timeout_ms: u64,
        /// What to do.
        action: CommandAction,
    },
}

/// Rejection codes for `connect_error` frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectErrorCode {
    /// Missing, malformed, unknown, or revoked token.
    InvalidToken,
    /// Token exists but has expired.
    TokenExpired,
    /// Connection budget exhausted.
    RateLimited,
    /// The relay itself failed.
    ServerError,
}

/// Frames sent by the extension to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExtensionMessage {
    /// A tab opted into relay control.
    TabAttach {
        /// Extension-chosen opaque tab id.
        tab_id: String,
        /// Current URL.
        url: String,
        /// Current title.
        title: String,
        /// Favicon URL, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fav_icon_url: Option<String>,
    },
    /// A tab left relay control.
    TabDetach {
        /// The departing tab.
        tab_id: String,
    },
    /// URL and/or title changed on an attached tab.
    TabUpdate {
        /// The tab that changed.
        tab_id: String,
        /// New URL, when it changed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// New title, when it changed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Heartbeat reply to a server `ping`.
    Pong {
        /// Timestamp echoed from the ping.
        timestamp: i64,
        /// Number of attached tabs.
        #[serde(default)]
        tab_count: u32,
    },
    /// Result of a previously dispatched command.
    CommandResponse(CommandResponse),
}

/// The action half of a command frame, discriminated by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum CommandAction {
    /// Click an element or a point.
    Click {
        /// CSS selector of the target; mutually optional with coordinates.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        /// Viewport coordinates to click instead of a selector.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinates: Option<Point>,
        /// Mouse button, left by default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        button: Option<MouseButton>,
        /// Held modifier keys.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modifiers: Option<Vec<KeyModifier>>,
    },
    /// Type text into an element.
    Type {
        /// CSS selector of the input.
        selector: String,
        /// Text to type.
        text: String,
        /// Clear the field first.
        #[serde(default)]
        clear: bool,
        /// Per-keystroke delay in milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<u32>,
    },
    /// Scroll an element or the page.
    Scroll {
        /// CSS selector of the scroll container; the page when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        /// Scroll direction.
        direction: ScrollDirection,
        /// Scroll distance in pixels.
        amount: i32,
    },
    /// Capture a screenshot.
    Screenshot {
        /// Capture the full page instead of the viewport.
        #[serde(default)]
        full_page: bool,
        /// Capture only this region.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clip: Option<Rect>,
        /// JPEG quality, 0-100.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quality: Option<u8>,
        /// Output encoding.
        #[serde(default)]
        format: ImageFormat,
    },
    /// Capture a DOM snapshot.
    Snapshot {
        /// Maximum DOM depth to serialize.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_depth: Option<u32>,
        /// Maximum serialized length in bytes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<u32>,
        /// Include computed styles.
        #[serde(default)]
        include_styles: bool,
    },
    /// Navigate the tab to a URL.
    Navigate {
        /// Destination URL.
        url: String,
        /// Load milestone to wait for before responding.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_until: Option<WaitUntil>,
    },
}

/// Mouse buttons for click actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    /// Primary button.
    Left,
    /// Middle button / wheel.
    Middle,
    /// Secondary button.
    Right,
}

/// Modifier keys held during a click.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyModifier {
    /// Control.
    Ctrl,
    /// Shift.
    Shift,
    /// Alt / Option.
    Alt,
    /// Meta / Command / Windows.
    Meta,
}

/// Scroll directions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    /// Toward the top.
    Up,
    /// Toward the bottom.
    Down,
    /// Toward the left edge.
    Left,
    /// Toward the right edge.
    Right,
}

/// Screenshot encodings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Lossless PNG (the default).
    #[default]
    Png,
    /// Lossy JPEG.
    Jpeg,
}

impl ImageFormat {
    /// File extension for artifacts in this format.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }
}

/// Navigation milestones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    /// The `load` event fired.
    Load,
    /// The `DOMContentLoaded` event fired.
    DomContentLoaded,
    /// The network went quiet.
    NetworkIdle,
}

/// Viewport coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Point {
    /// Horizontal offset in pixels.
    pub x: i32,
    /// Vertical offset in pixels.
    pub y: i32,
}

/// A rectangular region.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
}

/// Result of a command, correlated back to its dispatch by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    /// Correlation id from the command frame.
    pub id: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Action-specific result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Action-level failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    /// Extension-side timing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<CommandTiming>,
}

/// Action-level error detail from the extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandError {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Extension-side command timing, milliseconds since the epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandTiming {
    /// When the extension received the command.
    pub received: i64,
    /// When the extension finished it.
    pub completed: i64,
}

/// A browser tab the extension has opted into controlling.
///
/// Owned by its session; mutated only by that session's inbound tab frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    /// Extension-chosen opaque id.
    pub id: String,
    /// Current URL.
    pub url: String,
    /// Current title.
    pub title: String,
    /// Favicon URL, if the extension reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
    /// When the tab attached.
    pub attached_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_ack_wire_shape() {
        let ack = ServerMessage::ConnectAck {
            session_id: "s-1".into(),
            server_time: 1_700_000_000_000,
            server_version: "0.1.0".into(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&ack).unwrap()).unwrap();
        assert_eq!(json["type"], "connect_ack");
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["serverVersion"], "0.1.0");
    }

    #[test]
    fn connect_error_codes_are_screaming() {
        let err = ServerMessage::ConnectError {
            code: ConnectErrorCode::InvalidToken,
            message: "nope".into(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&err).unwrap()).unwrap();
        assert_eq!(json["type"], "connect_error");
        assert_eq!(json["code"], "INVALID_TOKEN");
    }

    #[test]
    fn command_frame_nests_the_action() {
        let cmd = ServerMessage::Command {
            id: "c-1".into(),
            tab_id: "t-1".into(),
            timeout_ms: 5000,
            action: CommandAction::Click {
                selector: Some("#go".into()),
                coordinates: None,
                button: Some(MouseButton::Left),
                modifiers: None,
            },
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&cmd).unwrap()).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["tabId"], "t-1");
        assert_eq!(json["timeoutMs"], 5000);
        assert_eq!(json["action"]["kind"], "click");
        assert_eq!(json["action"]["selector"], "#go");
        assert_eq!(json["action"]["button"], "left");
    }

    #[test]
    fn tab_attach_parses_with_and_without_favicon() {
        let with: ExtensionMessage = serde_json::from_str(
            r#"{"type":"tab_attach","tabId":"t1","url":"https://example.test","title":"Example","favIconUrl":"https://example.test/f.ico"}"#,
        )
        .unwrap();
        match with {
            ExtensionMessage::TabAttach {
                tab_id,
                fav_icon_url,
                ..
            } => {
                assert_eq!(tab_id, "t1");
                assert!(fav_icon_url.is_some());
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let without: ExtensionMessage = serde_json::from_str(
            r#"{"type":"tab_attach","tabId":"t1","url":"https://example.test","title":"Example"}"#,
        )
        .unwrap();
        assert!(matches!(without, ExtensionMessage::TabAttach { .. }));
    }

    #[test]
    fn command_response_roundtrips_through_the_frame_enum() {
        let raw = r#"{"type":"command_response","id":"c-9","success":true,"result":{"clicked":true},"timing":{"received":1,"completed":2}}"#;
        let msg: ExtensionMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ExtensionMessage::CommandResponse(resp) => {
                assert_eq!(resp.id, "c-9");
                assert!(resp.success);
                assert_eq!(resp.result.unwrap()["clicked"], true);
                assert_eq!(resp.timing.unwrap().completed, 2);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn failed_response_carries_error_detail() {
        let raw = r#"{"type":"command_response","id":"c-9","success":false,"error":{"code":"ELEMENT_NOT_FOUND","message":"no such selector"}}"#;
        let msg: ExtensionMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ExtensionMessage::CommandResponse(resp) => {
                assert!(!resp.success);
                assert_eq!(resp.error.unwrap().code, "ELEMENT_NOT_FOUND");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_fails_to_parse() {
        let raw = r#"{"type":"telemetry","payload":{}}"#;
        assert!(serde_json::from_str::<ExtensionMessage>(raw).is_err());
    }

    #[test]
    fn unknown_action_kind_is_rejected() {
        let raw = r#"{"kind":"evaluate","script":"1+1"}"#;
        assert!(serde_json::from_str::<CommandAction>(raw).is_err());
    }

    #[test]
    fn type_action_parses_keyword_kind() {
        let raw = r##"{"kind":"type","selector":"#q","text":"hello","clear":true}"##;
        let action: CommandAction = serde_json::from_str(raw).unwrap();
        match action {
            CommandAction::Type {
                selector,
                text,
                clear,
                delay,
            } => {
                assert_eq!(selector, "#q");
                assert_eq!(text, "hello");
                assert!(clear);
                assert!(delay.is_none());
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn navigate_wait_until_names() {
        let raw = r#"{"kind":"navigate","url":"https://example.test","waitUntil":"domcontentloaded"}"#;
        let action: CommandAction = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            action,
            CommandAction::Navigate {
                wait_until: Some(WaitUntil::DomContentLoaded),
                ..
            }
        ));
    }

    #[test]
    fn screenshot_format_defaults_to_png() {
        let raw = r#"{"kind":"screenshot"}"#;
        let action: CommandAction = serde_json::from_str(raw).unwrap();
        match action {
            CommandAction::Screenshot { format, .. } => assert_eq!(format, ImageFormat::Png),
            other => panic!("unexpected action: {other:?}"),
        }
        assert_eq!(ImageFormat::Jpeg.extension(), "jpeg");
    }

    #[test]
    fn pong_tolerates_missing_tab_count() {
        let raw = r#"{"type":"pong","timestamp":123}"#;
        let msg: ExtensionMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            msg,
            ExtensionMessage::Pong {
                timestamp: 123,
                tab_count: 0
            }
        ));
    }
}
