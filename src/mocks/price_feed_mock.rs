use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use rust_decimal::Decimal;

use crate::oracle::{PriceFeed, PriceQuote, VenuePrice};
use crate::types::{PriceFeedError, PriceFeedResult};

/// 호출 횟수를 기록하는 가격 피드 mock
#[derive(Default)]
pub struct MockPriceFeed {
    quotes: DashMap<String, PriceQuote>,
    venues: DashMap<String, Vec<VenuePrice>>,
    tokens: DashMap<String, Address>,
    quote_calls: AtomicUsize,
    venue_calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl MockPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// 기본 시세가 들어간 mock (mock 실행 모드용)
    pub fn with_defaults() -> Self {
        let feed = Self::new();
        for (symbol, price, change) in [
            ("ETH", 3400, 1.5),
            ("WETH", 3400, 1.5),
            ("USDC", 1, 0.01),
            ("USDT", 1, 0.02),
            ("DAI", 1, 0.01),
            ("WBTC", 62000, -0.8),
        ] {
            feed.set_quote(
                symbol,
                PriceQuote {
                    price: Decimal::from(price),
                    change_24h: Some(change),
                    volume_24h: Some(Decimal::from(5_000_000)),
                    market_cap: None,
                },
            );
        }
        feed
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.set_quote(symbol, PriceQuote::price_only(price));
    }

    pub fn set_quote(&self, symbol: &str, quote: PriceQuote) {
        self.quotes.insert(symbol.to_uppercase(), quote);
    }

    pub fn set_venue_prices(&self, symbol: &str, prices: &[(&str, Decimal)]) {
        let venues = prices
            .iter()
            .map(|(venue, price)| VenuePrice {
                venue: venue.to_string(),
                price: *price,
            })
            .collect();
        self.venues.insert(symbol.to_uppercase(), venues);
    }

    pub fn register_token(&self, symbol: &str, address: Address) {
        self.tokens.insert(symbol.to_uppercase(), address);
    }

    /// true면 모든 조회가 HTTP 오류를 반환
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn quote_calls(&self) -> usize {
        self.quote_calls.load(Ordering::SeqCst)
    }

    pub fn venue_calls(&self) -> usize {
        self.venue_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> PriceFeedResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PriceFeedError::Http("mock price feed unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PriceFeed for MockPriceFeed {
    async fn get_real_time_price(&self, symbol: &str, quote: &str) -> PriceFeedResult<Option<Decimal>> {
        Ok(self.get_quote(symbol, quote).await?.map(|q| q.price))
    }

    async fn get_quote(&self, symbol: &str, _quote: &str) -> PriceFeedResult<Option<PriceQuote>> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.quotes.get(&symbol.to_uppercase()).map(|q| q.clone()))
    }

    async fn get_venue_prices(&self, symbol: &str, _quote: &str) -> PriceFeedResult<Vec<VenuePrice>> {
        self.venue_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self
            .venues
            .get(&symbol.to_uppercase())
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    fn get_token_address(&self, symbol: &str) -> Option<Address> {
        self.tokens.get(&symbol.to_uppercase()).map(|a| *a)
    }

    fn get_token_symbol(&self, address: Address) -> Option<String> {
        self.tokens
            .iter()
            .find(|entry| *entry.value() == address)
            .map(|entry| entry.key().clone())
    }
}
