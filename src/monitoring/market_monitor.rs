use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ethers::types::Address;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::{
    fallback_price, fallback_volume, DEFAULT_LIQUIDITY_USD, DEFAULT_VOLATILITY,
    LIQUIDITY_VOLUME_MULTIPLIER, VOLATILITY_DIVISOR,
};
use crate::oracle::{PriceFeed, PriceQuote};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PriceOrigin {
    Feed,
    Fallback,
}

/// 토큰 시세 캐시 항목
#[derive(Debug, Clone)]
pub struct PriceCacheEntry {
    pub token_key: String,
    pub price: Decimal,
    pub change_24h: Option<f64>,
    pub volume: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub fetched_at: Instant,
    pub origin: PriceOrigin,
}

impl PriceCacheEntry {
    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < ttl
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceData {
    pub price: Decimal,
    pub volume: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub change_24h: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketFeatures {
    pub price: Decimal,
    pub volume: Decimal,
    pub liquidity: Decimal,
    /// 0.0 ~ 1.0
    pub volatility: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarketTrend {
    Bullish,
    Bearish,
    Sideways,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketConditions {
    pub high_volatility: bool,
    pub bullish_trend: bool,
    pub bearish_trend: bool,
    pub low_liquidity: bool,
}

/// 가격 스프레드 (%) = (max - min) / min * 100
pub fn price_spread_pct(prices: &[Decimal]) -> Option<f64> {
    let positive: Vec<Decimal> = prices.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
    if positive.len() < 2 {
        return None;
    }
    let max = positive.iter().copied().max()?;
    let min = positive.iter().copied().min()?;
    ((max - min) / min * Decimal::from(100)).to_f64()
}

/// 토큰 가격/거래량 TTL 캐시
pub struct MarketMonitor {
    feed: Arc<dyn PriceFeed>,
    ttl: Duration,
    cleanup_interval: Duration,
    request_timeout: Duration,
    quote_currency: String,
    cache: DashMap<String, PriceCacheEntry>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    last_sweep: Mutex<Instant>,
    fetches: AtomicU64,
    fallbacks: AtomicU64,
}

impl MarketMonitor {
    pub fn new(config: &Config, feed: Arc<dyn PriceFeed>) -> Self {
        Self::with_ttl(
            feed,
            config.market_cache_ttl(),
            Duration::from_secs(config.market.cleanup_interval_secs),
            Duration::from_millis(config.market.request_timeout_ms),
            config.market.quote_currency.clone(),
        )
    }

    pub fn with_ttl(
        feed: Arc<dyn PriceFeed>,
        ttl: Duration,
        cleanup_interval: Duration,
        request_timeout: Duration,
        quote_currency: String,
    ) -> Self {
        info!("📈 MarketMonitor 초기화 (TTL {:?})", ttl);
        Self {
            feed,
            ttl,
            cleanup_interval,
            request_timeout,
            quote_currency: quote_currency.to_uppercase(),
            cache: DashMap::new(),
            refresh_locks: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
            fetches: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// 주소 문자열이면 심볼로 변환
    fn resolve_symbol(&self, token: &str) -> String {
        if token.starts_with("0x") {
            if let Ok(address) = token.parse::<Address>() {
                if let Some(symbol) = self.feed.get_token_symbol(address) {
                    return symbol.to_uppercase();
                }
            }
        }
        token.to_uppercase()
    }

    fn cache_key(symbol: &str, quote: &str) -> String {
        format!("{}_{}", symbol, quote.to_uppercase())
    }

    fn fresh_entry(&self, key: &str) -> Option<PriceCacheEntry> {
        let now = Instant::now();
        self.cache
            .get(key)
            .filter(|entry| entry.is_fresh(self.ttl, now))
            .map(|entry| entry.clone())
    }

    fn fallback_quote(symbol: &str, quote: &str) -> Option<PriceQuote> {
        let price = fallback_price(symbol)?;
        let price = match quote {
            "USD" | "USDT" => price,
            other => {
                let quote_price = fallback_price(other)?;
                if quote_price.is_zero() {
                    return None;
                }
                price / quote_price
            }
        };
        Some(PriceQuote {
            price,
            change_24h: None,
            volume_24h: fallback_volume(symbol),
            market_cap: None,
        })
    }

    /// TTL 내면 캐시, 아니면 키 단위 락 아래에서 한 번만 갱신
    async fn get_entry(&self, token: &str, quote: &str) -> Option<PriceCacheEntry> {
        self.maybe_sweep().await;

        let symbol = self.resolve_symbol(token);
        let quote = quote.to_uppercase();
        let key = Self::cache_key(&symbol, &quote);

        if let Some(entry) = self.fresh_entry(&key) {
            return Some(entry);
        }

        let lock = self
            .refresh_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // 대기하는 동안 다른 태스크가 갱신했을 수 있음
        if let Some(entry) = self.fresh_entry(&key) {
            return Some(entry);
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let fetched = tokio::time::timeout(self.request_timeout, self.feed.get_quote(&symbol, &quote)).await;

        let (quote_data, origin) = match fetched {
            Ok(Ok(Some(q))) if q.price > Decimal::ZERO => (q, PriceOrigin::Feed),
            other => {
                match other {
                    Ok(Err(e)) => warn!("⚠️ 가격 조회 실패 ({}): {}", key, e),
                    Err(_) => warn!("⚠️ 가격 조회 타임아웃 ({})", key),
                    _ => debug!("가격 없음 ({}), 대체 가격 사용", key),
                }
                let fallback = Self::fallback_quote(&symbol, &quote)?;
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                (fallback, PriceOrigin::Fallback)
            }
        };

        let entry = PriceCacheEntry {
            token_key: key.clone(),
            price: quote_data.price,
            change_24h: quote_data.change_24h,
            volume: quote_data.volume_24h,
            market_cap: quote_data.market_cap,
            fetched_at: Instant::now(),
            origin,
        };
        self.cache.insert(key, entry.clone());
        Some(entry)
    }

    pub async fn get_token_price(&self, token: &str) -> Option<Decimal> {
        let quote = self.quote_currency.clone();
        self.get_token_price_in(token, &quote).await
    }

    pub async fn get_token_price_in(&self, token: &str, quote: &str) -> Option<Decimal> {
        self.get_entry(token, quote).await.map(|e| e.price)
    }

    pub async fn get_price_data(&self, token: &str) -> Option<PriceData> {
        let quote = self.quote_currency.clone();
        let entry = self.get_entry(token, &quote).await?;
        Some(PriceData {
            price: entry.price,
            volume: entry.volume,
            market_cap: entry.market_cap,
            change_24h: entry.change_24h,
        })
    }

    pub async fn get_token_volume(&self, token: &str) -> Option<Decimal> {
        let quote = self.quote_currency.clone();
        match self.get_entry(token, &quote).await.and_then(|e| e.volume) {
            Some(volume) => Some(volume),
            None => fallback_volume(&self.resolve_symbol(token)),
        }
    }

    pub async fn is_arbitrage_opportunity(&self, token: &str, min_spread_pct: f64) -> bool {
        let symbol = self.resolve_symbol(token);
        let venues = match tokio::time::timeout(
            self.request_timeout,
            self.feed.get_venue_prices(&symbol, &self.quote_currency),
        )
        .await
        {
            Ok(Ok(venues)) => venues,
            Ok(Err(e)) => {
                warn!("⚠️ 거래소별 가격 조회 실패 ({}): {}", symbol, e);
                return false;
            }
            Err(_) => {
                warn!("⚠️ 거래소별 가격 조회 타임아웃 ({})", symbol);
                return false;
            }
        };

        let prices: Vec<Decimal> = venues.iter().map(|v| v.price).collect();
        match price_spread_pct(&prices) {
            Some(spread) => {
                debug!("{} 스프레드 {:.3}% (기준 {:.3}%)", symbol, spread, min_spread_pct);
                spread >= min_spread_pct
            }
            None => false,
        }
    }

    pub async fn get_market_features(&self, token: &str) -> Option<MarketFeatures> {
        let data = self.get_price_data(token).await?;
        let volume = match data.volume {
            Some(volume) => volume,
            None => fallback_volume(&self.resolve_symbol(token)).unwrap_or_default(),
        };
        let liquidity = if volume > Decimal::ZERO {
            volume * Decimal::from(LIQUIDITY_VOLUME_MULTIPLIER)
        } else {
            Decimal::from(DEFAULT_LIQUIDITY_USD)
        };
        let volatility = data
            .change_24h
            .map(|c| (c.abs() / VOLATILITY_DIVISOR).min(1.0))
            .unwrap_or(DEFAULT_VOLATILITY);

        Some(MarketFeatures {
            price: data.price,
            volume,
            liquidity,
            volatility,
        })
    }

    pub async fn get_market_trend(&self, token: &str) -> MarketTrend {
        match self.get_price_data(token).await.and_then(|d| d.change_24h) {
            Some(change) if change > 2.0 => MarketTrend::Bullish,
            Some(change) if change < -2.0 => MarketTrend::Bearish,
            _ => MarketTrend::Sideways,
        }
    }

    pub async fn check_market_conditions(&self, token: &str) -> Option<MarketConditions> {
        let features = self.get_market_features(token).await?;
        let trend = self.get_market_trend(token).await;
        Some(MarketConditions {
            high_volatility: features.volatility > 0.5,
            bullish_trend: trend == MarketTrend::Bullish,
            bearish_trend: trend == MarketTrend::Bearish,
            low_liquidity: features.liquidity < Decimal::from(DEFAULT_LIQUIDITY_USD),
        })
    }

    /// 감시 토큰 가격을 미리 갱신. 성공한 개수 반환
    pub async fn prewarm(&self, tokens: &[String]) -> usize {
        let mut refreshed = 0;
        for token in tokens {
            if self.get_token_price(token).await.is_some() {
                refreshed += 1;
            }
        }
        refreshed
    }

    async fn maybe_sweep(&self) {
        let Ok(mut last_sweep) = self.last_sweep.try_lock() else {
            return;
        };
        if last_sweep.elapsed() < self.cleanup_interval {
            return;
        }
        *last_sweep = Instant::now();
        drop(last_sweep);
        self.sweep_expired();
    }

    /// 만료된 항목만 제거. 제거된 개수 반환
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.is_fresh(self.ttl, now));
        self.refresh_locks
            .retain(|key, lock| self.cache.contains_key(key) || Arc::strong_count(lock) > 1);
        let removed = before.saturating_sub(self.cache.len());
        if removed > 0 {
            debug!("🧹 만료된 가격 캐시 {}개 제거", removed);
        }
        removed
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn cached_entry(&self, token: &str) -> Option<PriceCacheEntry> {
        let key = Self::cache_key(&self.resolve_symbol(token), &self.quote_currency);
        self.cache.get(&key).map(|e| e.clone())
    }

    pub fn close(&self) {
        self.cache.clear();
        self.refresh_locks.clear();
        info!("📈 MarketMonitor 종료 (fetch {}회, 대체 가격 {}회)",
              self.fetches.load(Ordering::Relaxed), self.fallbacks.load(Ordering::Relaxed));
    }
}
