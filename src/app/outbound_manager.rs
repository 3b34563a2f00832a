use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::types::OutboundConfig;
use crate::proxy::outbound::direct::DirectOutbound;
use crate::proxy::OutboundHandler;

pub struct OutboundManager {
    handlers: HashMap<String, Arc<dyn OutboundHandler>>,
}

impl OutboundManager {
    pub fn new(configs: &[OutboundConfig]) -> Result<Self> {
        let mut handlers: HashMap<String, Arc<dyn OutboundHandler>> = HashMap::new();
        for config in configs {
            let handler: Arc<dyn OutboundHandler> = match config.protocol.as_str() {
                "direct" => Arc::new(DirectOutbound::new(config.tag.clone())),
                other => anyhow::bail!("unsupported outbound protocol: {}", other),
            };
            info!(tag = config.tag, protocol = config.protocol, "outbound registered");
            handlers.insert(config.tag.clone(), handler);
        }
        Ok(Self { handlers })
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.handlers.get(tag).cloned()
    }

    /// 直接注册一个处理器（测试用）
    pub fn insert(&mut self, handler: Arc<dyn OutboundHandler>) {
        self.handlers.insert(handler.tag().to_string(), handler);
    }
}
