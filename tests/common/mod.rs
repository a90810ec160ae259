// tests/common/mod.rs - Shared integration-test plumbing
#![allow(dead_code)]

use std::time::{Duration, Instant};

use mas_platform::acl::AclMessage;
use mas_platform::bus::Endpoint;
use mas_platform::config::PlatformConfig;

/// Tight timeouts so failure paths stay fast under test
pub fn test_config() -> PlatformConfig {
    PlatformConfig {
        coord_req_timeout: 2.0,
        coord_kb_timeout: 2.0,
        presenter_timeout: 5.0,
        coord_conv_grace_sec: 0.1,
        ..Default::default()
    }
}

/// Send a frame and wait for the reply correlated to its `reply_with`.
pub async fn send_and_wait(
    endpoint: &mut Endpoint,
    to: &str,
    frame: &AclMessage,
    timeout: Duration,
) -> Option<AclMessage> {
    endpoint.send(to, frame).await.expect("send");
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let delivery = endpoint.recv_timeout(remaining).await?;
        let Ok(acl) = AclMessage::from_json(&delivery.body) else {
            continue;
        };
        if acl.in_reply_to == frame.reply_with {
            return Some(acl);
        }
    }
}
