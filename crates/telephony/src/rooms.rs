//! Deterministic room naming.
//!
//! `sip_{orgId}_{agentId}_{shortRand}` so the dispatch webhook can parse
//! the organization and agent back out of the room name. Ids are UUIDs
//! (no underscores), which keeps parsing unambiguous.

use rand::Rng;

const ROOM_PREFIX: &str = "sip_";
const RAND_LEN: usize = 6;

/// Build a room name for an org/agent pair.
pub fn room_name(organization_id: &str, agent_id: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(RAND_LEN)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{ROOM_PREFIX}{organization_id}_{agent_id}_{suffix}")
}

/// Parse `(organization_id, agent_id)` back out of a room name.
pub fn parse_room_name(room: &str) -> Option<(String, String)> {
    let rest = room.strip_prefix(ROOM_PREFIX)?;
    let (rest, _rand) = rest.rsplit_once('_')?;
    let (organization_id, agent_id) = rest.rsplit_once('_')?;
    if organization_id.is_empty() || agent_id.is_empty() {
        return None;
    }
    Some((organization_id.to_string(), agent_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let name = room_name("org-12ab", "agent-34cd");
        let (org, agent) = parse_room_name(&name).unwrap();
        assert_eq!(org, "org-12ab");
        assert_eq!(agent, "agent-34cd");
    }

    #[test]
    fn distinct_calls_get_distinct_rooms() {
        let a = room_name("o", "a");
        let b = room_name("o", "a");
        assert_ne!(a, b);
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert!(parse_room_name("web_room_1").is_none());
        assert!(parse_room_name("sip_only").is_none());
        assert!(parse_room_name("sip__x_y").is_none());
    }
}
