/// Block template pushed by the daemon over the mining port (`miner-notify`)

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockTemplate {
    #[serde(rename = "block")]
    pub height: u64,
    #[serde(default)]
    pub version: u32,
    /// Header bytes before the miner payload (hex)
    pub part1: String,
    #[serde(default)]
    pub payload_start: String,
    /// Header bytes after the miner payload, up to the timestamp (hex)
    pub part3: String,
    /// Compact network target
    pub target: u32,
    /// Full 256-bit target (hex)
    pub target_pow: String,
    pub timestamp: u32,
}

impl BlockTemplate {
    /// Parse `params[0]` of a `miner-notify` push.
    pub fn from_notify(params: &Value) -> Result<Self> {
        let raw = params
            .as_array()
            .and_then(|p| p.first())
            .ok_or_else(|| anyhow!("miner-notify without template"))?;
        serde_json::from_value(raw.clone()).map_err(|e| anyhow!("Failed to parse block template: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_notify() {
        let params = json!([{
            "block": 378001,
            "version": 5,
            "part1": "ab",
            "payload_start": "",
            "part3": "cd",
            "target": 0x2e000000u32,
            "target_pow": "0000ffff",
            "timestamp": 1_600_000_000u32
        }]);
        let tpl = BlockTemplate::from_notify(&params).unwrap();
        assert_eq!(tpl.height, 378001);
        assert_eq!(tpl.part1, "ab");
        assert_eq!(tpl.timestamp, 1_600_000_000);
    }

    #[test]
    fn test_from_notify_empty() {
        assert!(BlockTemplate::from_notify(&json!([])).is_err());
        assert!(BlockTemplate::from_notify(&json!([{"block": 1}])).is_err());
    }
}
