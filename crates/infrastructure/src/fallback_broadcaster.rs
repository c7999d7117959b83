use std::sync::{Arc, Mutex, MutexGuard};

use application::{BroadcastError, EventBus, EventEnvelope};
use async_trait::async_trait;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 断路器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// 正常状态，发布走 Redis
    Closed,
    /// 断开状态，跳过 Redis，只保留本地投递
    Open,
    /// 半开状态，放行少量发布探测 Redis 是否恢复
    HalfOpen,
}

/// 断路器配置
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// 连续失败多少次后断开
    pub failure_threshold: u64,
    /// 半开状态下连续成功多少次后闭合
    pub success_threshold: u64,
    /// 断开多久后进入半开
    pub open_timeout: Duration,
    /// 半开状态下最多放行的探测次数
    pub half_open_max_calls: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    half_open_calls: u64,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            opened_at: None,
        }
    }

    fn transition_to(&mut self, new_state: CircuitState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }
        self.state = new_state;
        match new_state {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.half_open_calls = 0;
                self.opened_at = None;
                info!(from = ?old_state, "断路器闭合，恢复跨实例发布");
            }
            CircuitState::Open => {
                self.success_count = 0;
                self.opened_at = Some(Instant::now());
                error!(from = ?old_state, "断路器断开，Redis 不可用，仅本地投递");
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
                self.half_open_calls = 0;
                warn!(from = ?old_state, "断路器半开，探测 Redis 是否恢复");
            }
        }
    }
}

/// 断路器保护的事件总线
///
/// 本地投递由网关在发布前完成；断开期间直接跳过发布并返回 0。
/// CLOSED → OPEN → HALF_OPEN → CLOSED。
pub struct FallbackEventBus {
    primary: Arc<dyn EventBus>,
    config: CircuitConfig,
    breaker: Mutex<Breaker>,
}

impl FallbackEventBus {
    pub fn new(primary: Arc<dyn EventBus>) -> Self {
        Self::with_config(primary, CircuitConfig::default())
    }

    pub fn with_config(primary: Arc<dyn EventBus>, config: CircuitConfig) -> Self {
        Self {
            primary,
            config,
            breaker: Mutex::new(Breaker::new()),
        }
    }

    fn breaker(&self) -> MutexGuard<'_, Breaker> {
        self.breaker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.breaker().state
    }

    fn can_attempt_request(&self) -> bool {
        let mut breaker = self.breaker();
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map_or(true, |opened_at| opened_at.elapsed() >= self.config.open_timeout);
                if elapsed {
                    breaker.transition_to(CircuitState::HalfOpen);
                    breaker.half_open_calls = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                breaker.half_open_calls += 1;
                breaker.half_open_calls <= self.config.half_open_max_calls
            }
        }
    }

    fn record_success(&self) {
        let mut breaker = self.breaker();
        match breaker.state {
            CircuitState::Closed => breaker.failure_count = 0,
            CircuitState::HalfOpen => {
                breaker.success_count += 1;
                if breaker.success_count >= self.config.success_threshold {
                    breaker.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut breaker = self.breaker();
        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count += 1;
                warn!(
                    failures = breaker.failure_count,
                    threshold = self.config.failure_threshold,
                    "跨实例发布失败"
                );
                if breaker.failure_count >= self.config.failure_threshold {
                    breaker.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => breaker.transition_to(CircuitState::Open),
            CircuitState::Open => breaker.opened_at = Some(Instant::now()),
        }
    }
}

#[async_trait]
impl EventBus for FallbackEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<usize, BroadcastError> {
        if !self.can_attempt_request() {
            debug!(event_id = %envelope.event_id, "断路器断开，跳过跨实例发布");
            return Ok(0);
        }
        match self.primary.publish(envelope).await {
            Ok(receivers) => {
                self.record_success();
                Ok(receivers)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}
