//! 连接生命周期策略。
//!
//! 每个 level 一组超时：空闲、仅上行、仅下行。转发管道据此
//! 重整活动计时器。

use std::time::Duration;

use crate::config::types::PolicyConfig;

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connection_idle: Duration,
    pub uplink_only: Duration,
    pub downlink_only: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub timeouts: Timeouts,
}

pub struct PolicyManager {
    level0: Policy,
}

impl PolicyManager {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            level0: Policy {
                timeouts: Timeouts {
                    connection_idle: Duration::from_secs(config.connection_idle),
                    uplink_only: Duration::from_secs(config.uplink_only),
                    downlink_only: Duration::from_secs(config.downlink_only),
                },
            },
        }
    }

    /// 目前只有 level 0；保留入参与平台侧接口一致
    pub fn for_level(&self, _level: u32) -> Policy {
        self.level0
    }
}

impl Default for PolicyManager {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level0_timeouts_from_config() {
        let manager = PolicyManager::new(&PolicyConfig {
            connection_idle: 120,
            uplink_only: 3,
            downlink_only: 7,
        });
        let policy = manager.for_level(0);
        assert_eq!(policy.timeouts.connection_idle, Duration::from_secs(120));
        assert_eq!(policy.timeouts.uplink_only, Duration::from_secs(3));
        assert_eq!(policy.timeouts.downlink_only, Duration::from_secs(7));
    }
}
