use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// 운영 알림 출구. 오케스트레이터가 생성해서 각 컴포넌트에 주입한다
pub trait AlertSink: Send + Sync {
    fn alert(&self, level: AlertLevel, message: &str);
}

/// tracing 로그로 알림을 내보내는 기본 구현
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Info => info!("🔔 {}", message),
            AlertLevel::Warning => warn!("⚠️ ALERT: {}", message),
            AlertLevel::Critical => error!("🚨 CRITICAL: {}", message),
        }
    }
}

/// 받은 알림을 보관 (테스트, mock 모드)
#[derive(Debug, Default)]
pub struct CollectingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl CollectingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn count(&self, level: AlertLevel) -> usize {
        self.alerts().iter().filter(|a| a.level == level).count()
    }
}

impl AlertSink for CollectingAlertSink {
    fn alert(&self, level: AlertLevel, message: &str) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(Alert {
                level,
                message: message.to_string(),
                raised_at: Utc::now(),
            });
        }
    }
}
