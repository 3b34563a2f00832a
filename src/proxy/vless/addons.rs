//! 连接级扩展记录（addons）。
//!
//! 随握手头传输，序列化为 protobuf 线格式；对端双方的 seed
//! 配置必须完全一致，否则拒绝会话。

use anyhow::Result;
use prost::Message;

use super::XRV;

#[derive(Clone, PartialEq, Message)]
pub struct Addons {
    #[prost(string, tag = "1")]
    pub flow: String,
    #[prost(bytes = "vec", tag = "2")]
    pub seed: Vec<u8>,
    #[prost(enumeration = "SeedMode", tag = "3")]
    pub mode: i32,
    #[prost(string, tag = "4")]
    pub duration: String,
    #[prost(message, optional, tag = "5")]
    pub padding: Option<PaddingConfig>,
    #[prost(message, optional, tag = "6")]
    pub delay: Option<DelayConfig>,
    #[prost(message, optional, tag = "7")]
    pub scheduler: Option<SchedulerConfig>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, prost::Enumeration)]
#[repr(i32)]
pub enum SeedMode {
    Unknown = 0,
    PaddingPlusDelay = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct PaddingConfig {
    #[prost(uint32, tag = "1")]
    pub regular_min: u32,
    #[prost(uint32, tag = "2")]
    pub regular_max: u32,
    #[prost(uint32, tag = "3")]
    pub long_min: u32,
    #[prost(uint32, tag = "4")]
    pub long_max: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct DelayConfig {
    #[prost(bool, tag = "1")]
    pub is_random: bool,
    #[prost(uint32, tag = "2")]
    pub min_millis: u32,
    #[prost(uint32, tag = "3")]
    pub max_millis: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct SchedulerConfig {
    #[prost(uint32, tag = "1")]
    pub timeout_millis: u32,
}

impl Addons {
    /// 头部需要携带 addons 的条件：vision 流控或启用了 seed
    pub fn carries_payload(&self) -> bool {
        self.flow == XRV || !self.seed.is_empty()
    }
}

/// 按 seed 字符串填充 addons 的 padding-plus-delay 档位
pub fn populate_seed(seed: &str, addons: &mut Addons) {
    if seed.is_empty() {
        return;
    }
    addons.seed = vec![1]; // 目前只表示开启
    addons.mode = SeedMode::PaddingPlusDelay as i32;
    addons.duration = "0-8".to_string();
    addons.padding = Some(PaddingConfig {
        regular_min: 0,
        regular_max: 256,
        long_min: 900,
        long_max: 1400,
    });
    addons.delay = Some(DelayConfig {
        is_random: true,
        min_millis: 100,
        max_millis: 500,
    });
    addons.scheduler = Some(SchedulerConfig {
        timeout_millis: 600,
    });
}

/// 校验请求/响应两侧的 addons 配置一致。
///
/// seed、mode、duration 逐值比较；子记录要么两侧同时缺席，
/// 要么同时在场且字段全部相等。
pub fn check_seed(request: &Addons, response: &Addons) -> Result<()> {
    if request.seed != response.seed {
        anyhow::bail!(
            "seed bytes not match: {:?} vs {:?}",
            request.seed,
            response.seed
        );
    }
    if request.mode != response.mode {
        anyhow::bail!("mode not match: {} vs {}", request.mode, response.mode);
    }
    if request.duration != response.duration {
        anyhow::bail!(
            "duration not match: {} vs {}",
            request.duration,
            response.duration
        );
    }
    match (&request.padding, &response.padding) {
        (Some(a), Some(b)) => {
            if a.regular_min != b.regular_min
                || a.regular_max != b.regular_max
                || a.long_min != b.long_min
                || a.long_max != b.long_max
            {
                anyhow::bail!("padding not match");
            }
        }
        (None, None) => {}
        _ => anyhow::bail!("padding of one is nil but the other is not nil"),
    }
    match (&request.delay, &response.delay) {
        (Some(a), Some(b)) => {
            if a.is_random != b.is_random
                || a.min_millis != b.min_millis
                || a.max_millis != b.max_millis
            {
                anyhow::bail!("delay not match");
            }
        }
        (None, None) => {}
        _ => anyhow::bail!("delay of one is nil but the other is not nil"),
    }
    match (&request.scheduler, &response.scheduler) {
        (Some(a), Some(b)) => {
            if a.timeout_millis != b.timeout_millis {
                anyhow::bail!("scheduler not match");
            }
        }
        (None, None) => {}
        _ => anyhow::bail!("scheduler of one is nil but the other is not nil"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Addons {
        let mut addons = Addons::default();
        populate_seed("1", &mut addons);
        addons
    }

    #[test]
    fn populate_seed_fills_profile() {
        let addons = seeded();
        assert_eq!(addons.seed, vec![1]);
        assert_eq!(addons.mode, SeedMode::PaddingPlusDelay as i32);
        assert_eq!(addons.duration, "0-8");
        let padding = addons.padding.as_ref().unwrap();
        assert_eq!(padding.regular_max, 256);
        assert_eq!(padding.long_max, 1400);
        let delay = addons.delay.as_ref().unwrap();
        assert!(delay.is_random);
        assert_eq!(addons.scheduler.as_ref().unwrap().timeout_millis, 600);
    }

    #[test]
    fn populate_seed_empty_is_noop() {
        let mut addons = Addons::default();
        populate_seed("", &mut addons);
        assert_eq!(addons, Addons::default());
    }

    #[test]
    fn check_seed_accepts_equal() {
        assert!(check_seed(&seeded(), &seeded()).is_ok());
        assert!(check_seed(&Addons::default(), &Addons::default()).is_ok());
    }

    #[test]
    fn check_seed_is_symmetric() {
        let a = seeded();
        let mut b = seeded();
        b.duration = "0-4".to_string();
        assert!(check_seed(&a, &b).is_err());
        assert!(check_seed(&b, &a).is_err());
    }

    #[test]
    fn check_seed_rejects_value_mismatch() {
        let a = seeded();

        let mut b = seeded();
        b.seed = vec![2];
        assert!(check_seed(&a, &b).is_err());

        let mut b = seeded();
        b.mode = SeedMode::Unknown as i32;
        assert!(check_seed(&a, &b).is_err());

        let mut b = seeded();
        b.padding.as_mut().unwrap().long_min = 901;
        assert!(check_seed(&a, &b).is_err());

        let mut b = seeded();
        b.delay.as_mut().unwrap().max_millis = 501;
        assert!(check_seed(&a, &b).is_err());

        let mut b = seeded();
        b.scheduler.as_mut().unwrap().timeout_millis = 601;
        assert!(check_seed(&a, &b).is_err());
    }

    #[test]
    fn check_seed_rejects_presence_mismatch() {
        let a = seeded();

        let mut b = seeded();
        b.padding = None;
        assert!(check_seed(&a, &b).is_err());

        let mut b = seeded();
        b.delay = None;
        assert!(check_seed(&a, &b).is_err());

        let mut b = seeded();
        b.scheduler = None;
        assert!(check_seed(&a, &b).is_err());
    }
}
