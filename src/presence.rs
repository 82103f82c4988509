use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ReverbError;
use crate::message::id_from_value;

/// A single presence channel member.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: String,
    pub info: Value,
}

impl Member {
    /// Parse a `{"user_id": .., "user_info": ..}` payload.
    ///
    /// This is the shape of both `member_added` events and the `channel_data`
    /// returned by presence authorization.
    pub fn from_value(value: &Value) -> Result<Self, ReverbError> {
        let id = value
            .get("user_id")
            .and_then(id_from_value)
            .ok_or_else(|| ReverbError::ProtocolError("member payload has no user_id".into()))?;
        let info = value.get("user_info").cloned().unwrap_or(Value::Null);
        Ok(Self { id, info })
    }
}

#[derive(Debug, Deserialize)]
struct PresencePayload {
    presence: PresenceData,
}

#[derive(Debug, Deserialize)]
struct PresenceData {
    #[serde(default)]
    ids: Vec<Value>,
    #[serde(default)]
    hash: HashMap<String, Value>,
}

/// Roster of a subscribed presence channel.
///
/// Applications receive snapshots of this type; the roster itself is only
/// mutated by server events handled inside the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Members {
    members: HashMap<String, Value>,
    me: Option<Member>,
}

impl Members {
    pub(crate) fn new(me: Option<Member>) -> Self {
        Self {
            members: HashMap::new(),
            me,
        }
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Member> {
        self.members.get(id).map(|info| Member {
            id: id.to_string(),
            info: info.clone(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    /// The subscribing client's own identity, from its authorization payload.
    pub fn me(&self) -> Option<&Member> {
        self.me.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.members.iter().map(|(id, info)| (id.as_str(), info))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.members.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replace the whole roster from a `subscription_succeeded` payload.
    pub(crate) fn replace_from_payload(&mut self, data: &Value) -> Result<(), ReverbError> {
        let payload: PresencePayload = serde_json::from_value(data.clone())
            .map_err(|e| ReverbError::ProtocolError(format!("invalid presence payload: {e}")))?;

        let mut members = payload.presence.hash;
        for id in payload.presence.ids.iter().filter_map(id_from_value) {
            members.entry(id).or_insert(Value::Null);
        }
        self.members = members;
        Ok(())
    }

    /// Insert or update; returns true when the member was not present before.
    pub(crate) fn add(&mut self, member: Member) -> bool {
        self.members.insert(member.id, member.info).is_none()
    }

    /// Delete if present.
    pub(crate) fn remove(&mut self, id: &str) -> Option<Member> {
        self.members.remove(id).map(|info| Member {
            id: id.to_string(),
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn initial() -> Members {
        let mut members = Members::new(None);
        members
            .replace_from_payload(&json!({
                "presence": {"ids": ["1", "2"], "hash": {"1": "A", "2": "B"}, "count": 2}
            }))
            .unwrap();
        members
    }

    #[test]
    fn removal_after_initial_roster() {
        let mut members = initial();
        assert_eq!(members.remove("1").map(|m| m.info), Some(json!("A")));
        assert_eq!(members.ids(), vec!["2".to_string()]);
        assert_eq!(members.get("2").unwrap().info, json!("B"));
    }

    #[test]
    fn replace_does_not_merge() {
        let mut members = initial();
        members.add(Member {
            id: "9".into(),
            info: json!({}),
        });
        members
            .replace_from_payload(&json!({"presence": {"ids": ["3"], "hash": {"3": {"name": "C"}}}}))
            .unwrap();
        assert_eq!(members.ids(), vec!["3".to_string()]);
    }

    #[test]
    fn ids_without_hash_entries_are_kept() {
        let mut members = Members::new(None);
        members
            .replace_from_payload(&json!({"presence": {"ids": [7, "8"], "hash": {}}}))
            .unwrap();
        assert_eq!(members.ids(), vec!["7".to_string(), "8".to_string()]);
        assert_eq!(members.get("7").unwrap().info, Value::Null);
    }

    #[test]
    fn folding_is_insensitive_to_duplicate_adds_and_absent_removes() {
        enum Op {
            Add(&'static str, &'static str),
            Remove(&'static str),
        }

        let apply = |ops: &[Op]| {
            let mut members = initial();
            for op in ops {
                match op {
                    Op::Add(id, info) => {
                        members.add(Member {
                            id: id.to_string(),
                            info: json!(info),
                        });
                    }
                    Op::Remove(id) => {
                        members.remove(id);
                    }
                }
            }
            members
        };

        let plain = apply(&[Op::Add("3", "C"), Op::Remove("1")]);
        let noisy = apply(&[
            Op::Add("3", "C"),
            Op::Add("3", "C"),
            Op::Remove("1"),
            Op::Remove("1"),
            Op::Remove("404"),
        ]);
        assert_eq!(plain, noisy);
        assert_eq!(noisy.ids(), vec!["2".to_string(), "3".to_string()]);
    }

    #[test]
    fn add_reports_only_new_members() {
        let mut members = initial();
        assert!(!members.add(Member {
            id: "1".into(),
            info: json!("A2"),
        }));
        assert_eq!(members.get("1").unwrap().info, json!("A2"));
        assert!(members.add(Member {
            id: "5".into(),
            info: json!("E"),
        }));
        assert_eq!(members.count(), 3);
    }

    #[test]
    fn member_from_channel_data() {
        let me = Member::from_value(&json!({"user_id": 12, "user_info": {"name": "Ada"}})).unwrap();
        assert_eq!(me.id, "12");
        assert_eq!(me.info["name"], "Ada");

        assert!(Member::from_value(&json!({"user_info": {}})).is_err());
    }
}
