use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// Header carrying the requester identity on mutating calls.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLobbyRequest {
    pub name: String,
    pub mode: String,
    pub max_players: u32,
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLobbyResponse {
    pub id: i64,
    pub server_address: String,
    pub server_port: u16,
    pub expires_at: DateTime<Utc>,
}

/// Status shown for a lobby after merging stored metadata with the live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStatus {
    Online,
    Initializing,
    Offline,
}

impl DisplayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayStatus::Online => "online",
            DisplayStatus::Initializing => "initializing",
            DisplayStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of `GET /lobbies`.
///
/// `map` and `max_players` carry the live values when the instance reports
/// online, the stored ones otherwise. `players` is only known while online.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyView {
    pub id: i64,
    pub name: String,
    pub mode: String,
    pub map: String,
    pub max_players: u32,
    pub players: Option<u32>,
    pub has_access_secret: bool,
    pub creator: String,
    pub server_address: String,
    pub server_port: u16,
    pub status: DisplayStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LobbyView {
    /// Player count rendered as `current/max`, or `-/max` when unknown.
    pub fn occupancy(&self) -> String {
        match self.players {
            Some(current) => format!("{}/{}", current, self.max_players),
            None => format!("-/{}", self.max_players),
        }
    }
}

/// One entry of `GET /leases`, visible to administrators only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseView {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub credential_id: i64,
    pub instance_handle: String,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleRequest {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleResponse {
    pub lines: Vec<String>,
}

/// JSON body returned with every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_uses_camel_case_and_optional_secret() {
        let json = r#"{"name":"Friday scrim","mode":"competitive","maxPlayers":10,"map":"de_dust2"}"#;
        let req: CreateLobbyRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.max_players, 10);
        assert!(req.access_secret.is_none());

        let out = serde_json::to_value(&req).unwrap();
        assert!(out.get("accessSecret").is_none());
        assert_eq!(out["maxPlayers"], 10);
    }

    #[test]
    fn display_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&DisplayStatus::Initializing).unwrap(), "\"initializing\"");
        let status: DisplayStatus = serde_json::from_str("\"online\"").unwrap();
        assert_eq!(status, DisplayStatus::Online);
    }

    #[test]
    fn occupancy_formats_known_and_unknown_counts() {
        let mut view = LobbyView {
            id: 1,
            name: "a".into(),
            mode: "casual".into(),
            map: "de_mirage".into(),
            max_players: 10,
            players: Some(4),
            has_access_secret: false,
            creator: "alice".into(),
            server_address: "10.0.0.1".into(),
            server_port: 27015,
            status: DisplayStatus::Online,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        };
        assert_eq!(view.occupancy(), "4/10");
        view.players = None;
        assert_eq!(view.occupancy(), "-/10");
    }
}
