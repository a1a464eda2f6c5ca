use std::collections::HashMap;

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Every entry already in the stream.
    Beginning,
    /// Only entries appended after the group exists.
    Latest,
}

/// An entry as delivered to a consumer: its position, its flat string fields
/// and how many times it has been handed out (1 on first delivery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: i64,
    pub fields: HashMap<String, String>,
    pub delivery_count: u32,
}

impl RawEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Names of everything one shard's consumer touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamKeys {
    pub shard: u32,
    /// `{basename}:{shard}`
    pub stream: String,
    /// `{basename}:{shard}:dlq`
    pub dead_letter: String,
    /// `{group}:{shard}`
    pub group: String,
}

impl StreamKeys {
    pub fn new(basename: &str, group: &str, shard: u32) -> Self {
        Self {
            shard,
            stream: format!("{basename}:{shard}"),
            dead_letter: format!("{basename}:{shard}:dlq"),
            group: format!("{group}:{shard}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_naming_convention() {
        let keys = StreamKeys::new("reactions", "workers", 3);
        assert_eq!(keys.stream, "reactions:3");
        assert_eq!(keys.dead_letter, "reactions:3:dlq");
        assert_eq!(keys.group, "workers:3");
    }
}
