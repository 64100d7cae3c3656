use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::Address;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::types::{PriceFeedError, PriceFeedResult};

/// 단일 조회로 얻는 시세 정보
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub price: Decimal,
    /// 24시간 변동률 (%)
    pub change_24h: Option<f64>,
    pub volume_24h: Option<Decimal>,
    pub market_cap: Option<Decimal>,
}

impl PriceQuote {
    pub fn price_only(price: Decimal) -> Self {
        Self {
            price,
            change_24h: None,
            volume_24h: None,
            market_cap: None,
        }
    }
}

/// 거래소별 가격
#[derive(Debug, Clone, PartialEq)]
pub struct VenuePrice {
    pub venue: String,
    pub price: Decimal,
}

/// 가격 피드 인터페이스
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn get_real_time_price(&self, symbol: &str, quote: &str) -> PriceFeedResult<Option<Decimal>>;

    async fn get_quote(&self, symbol: &str, quote: &str) -> PriceFeedResult<Option<PriceQuote>> {
        Ok(self
            .get_real_time_price(symbol, quote)
            .await?
            .map(PriceQuote::price_only))
    }

    /// 차익거래 판단용 거래소별 가격
    async fn get_venue_prices(&self, symbol: &str, quote: &str) -> PriceFeedResult<Vec<VenuePrice>>;

    fn get_token_address(&self, symbol: &str) -> Option<Address>;

    fn get_token_symbol(&self, address: Address) -> Option<String>;
}

/// Binance 24h 티커 + CoinGecko simple price 기반 가격 피드
pub struct HttpPriceFeed {
    client: reqwest::Client,
    binance_base_url: String,
    coingecko_base_url: String,
    symbol_to_address: HashMap<String, Address>,
    address_to_symbol: HashMap<Address, String>,
}

impl HttpPriceFeed {
    pub fn new(config: &Config) -> PriceFeedResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.market.request_timeout_ms))
            .build()
            .map_err(|e| PriceFeedError::Http(e.to_string()))?;

        let mut symbol_to_address = HashMap::new();
        let mut address_to_symbol = HashMap::new();
        for (symbol, address) in &config.tokens {
            if let Ok(addr) = address.parse::<Address>() {
                symbol_to_address.insert(symbol.to_uppercase(), addr);
                address_to_symbol.insert(addr, symbol.to_uppercase());
            }
        }

        Ok(Self {
            client,
            binance_base_url: config.market.binance_base_url.trim_end_matches('/').to_string(),
            coingecko_base_url: config.market.coingecko_base_url.trim_end_matches('/').to_string(),
            symbol_to_address,
            address_to_symbol,
        })
    }

    async fn get_json(&self, url: &str) -> PriceFeedResult<Value> {
        let response = self.client.get(url).send().await.map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            return Err(PriceFeedError::Http(format!("{} -> {}", url, response.status())));
        }
        response.json::<Value>().await.map_err(|e| PriceFeedError::Parse(e.to_string()))
    }

    async fn fetch_binance(&self, symbol: &str, quote: &str) -> PriceFeedResult<Option<PriceQuote>> {
        let pair = binance_pair(symbol, quote);
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.binance_base_url, pair);
        let body = self.get_json(&url).await?;
        parse_binance_ticker(&body)
    }

    async fn fetch_coingecko(&self, symbol: &str, quote: &str) -> PriceFeedResult<Option<PriceQuote>> {
        let id = coingecko_id(symbol).ok_or_else(|| PriceFeedError::UnknownToken(symbol.to_string()))?;
        let vs = quote.to_lowercase();
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies={}&include_24hr_change=true&include_24hr_vol=true&include_market_cap=true",
            self.coingecko_base_url, id, vs
        );
        let body = self.get_json(&url).await?;
        parse_coingecko(&body, id, &vs)
    }
}

fn map_reqwest_error(error: reqwest::Error) -> PriceFeedError {
    if error.is_timeout() {
        PriceFeedError::Timeout
    } else {
        PriceFeedError::Http(error.to_string())
    }
}

/// 래핑 토큰은 원자산 심볼로 조회
fn canonical_symbol(symbol: &str) -> String {
    match symbol.to_uppercase().as_str() {
        "WETH" => "ETH".to_string(),
        "WBTC" => "BTC".to_string(),
        other => other.to_string(),
    }
}

fn binance_pair(symbol: &str, quote: &str) -> String {
    let quote = match quote.to_uppercase().as_str() {
        "USD" => "USDT".to_string(),
        other => other.to_string(),
    };
    format!("{}{}", canonical_symbol(symbol), quote)
}

fn coingecko_id(symbol: &str) -> Option<&'static str> {
    let id = match canonical_symbol(symbol).as_str() {
        "ETH" => "ethereum",
        "BTC" => "bitcoin",
        "USDT" => "tether",
        "USDC" => "usd-coin",
        "DAI" => "dai",
        "LINK" => "chainlink",
        "UNI" => "uniswap",
        "AAVE" => "aave",
        "MATIC" => "matic-network",
        "CRV" => "curve-dao-token",
        _ => return None,
    };
    Some(id)
}

fn decimal_field(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
        _ => None,
    }
}

fn float_field(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_binance_ticker(body: &Value) -> PriceFeedResult<Option<PriceQuote>> {
    let price = match body.get("lastPrice").and_then(decimal_field) {
        Some(price) if price > Decimal::ZERO => price,
        Some(_) => return Ok(None),
        None => return Err(PriceFeedError::Parse("binance ticker missing lastPrice".to_string())),
    };

    Ok(Some(PriceQuote {
        price,
        change_24h: body.get("priceChangePercent").and_then(float_field),
        volume_24h: body.get("quoteVolume").and_then(decimal_field),
        market_cap: None,
    }))
}

fn parse_coingecko(body: &Value, id: &str, vs: &str) -> PriceFeedResult<Option<PriceQuote>> {
    let entry = match body.get(id) {
        Some(entry) => entry,
        None => return Ok(None),
    };
    let price = match entry.get(vs).and_then(decimal_field) {
        Some(price) => price,
        None => return Ok(None),
    };

    Ok(Some(PriceQuote {
        price,
        change_24h: entry.get(format!("{}_24h_change", vs)).and_then(float_field),
        volume_24h: entry.get(format!("{}_24h_vol", vs)).and_then(decimal_field),
        market_cap: entry.get(format!("{}_market_cap", vs)).and_then(decimal_field),
    }))
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn get_real_time_price(&self, symbol: &str, quote: &str) -> PriceFeedResult<Option<Decimal>> {
        Ok(self.get_quote(symbol, quote).await?.map(|q| q.price))
    }

    async fn get_quote(&self, symbol: &str, quote: &str) -> PriceFeedResult<Option<PriceQuote>> {
        match self.fetch_coingecko(symbol, quote).await {
            Ok(Some(q)) => return Ok(Some(q)),
            Ok(None) => debug!("CoinGecko 가격 없음: {}", symbol),
            Err(e) => debug!("CoinGecko 조회 실패 ({}): {}", symbol, e),
        }
        self.fetch_binance(symbol, quote).await
    }

    async fn get_venue_prices(&self, symbol: &str, quote: &str) -> PriceFeedResult<Vec<VenuePrice>> {
        let (binance, coingecko) = tokio::join!(
            self.fetch_binance(symbol, quote),
            self.fetch_coingecko(symbol, quote)
        );

        let mut prices = Vec::new();
        let mut last_error = None;
        for (venue, result) in [("binance", binance), ("coingecko", coingecko)] {
            match result {
                Ok(Some(q)) => prices.push(VenuePrice {
                    venue: venue.to_string(),
                    price: q.price,
                }),
                Ok(None) => {}
                Err(e) => last_error = Some(e),
            }
        }

        match (prices.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(prices),
        }
    }

    fn get_token_address(&self, symbol: &str) -> Option<Address> {
        self.symbol_to_address.get(&symbol.to_uppercase()).copied()
    }

    fn get_token_symbol(&self, address: Address) -> Option<String> {
        self.address_to_symbol.get(&address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_symbol_mapping() {
        assert_eq!(binance_pair("weth", "USD"), "ETHUSDT");
        assert_eq!(binance_pair("LINK", "BTC"), "LINKBTC");
        assert_eq!(coingecko_id("WBTC"), Some("bitcoin"));
        assert_eq!(coingecko_id("NOPE"), None);
    }

    #[test]
    fn test_parse_binance_ticker() {
        let body = json!({
            "symbol": "ETHUSDT",
            "lastPrice": "3412.55",
            "priceChangePercent": "-2.310",
            "quoteVolume": "1234567.89"
        });
        let quote = parse_binance_ticker(&body).unwrap().unwrap();
        assert_eq!(quote.price, Decimal::from_str("3412.55").unwrap());
        assert_eq!(quote.change_24h, Some(-2.31));
        assert!(quote.volume_24h.is_some());
        assert!(quote.market_cap.is_none());

        assert!(parse_binance_ticker(&json!({"code": -1121})).is_err());
    }

    #[test]
    fn test_parse_coingecko() {
        let body = json!({
            "ethereum": {
                "usd": 3400.5,
                "usd_24h_change": 1.25,
                "usd_24h_vol": 15000000000.0,
                "usd_market_cap": 410000000000.0
            }
        });
        let quote = parse_coingecko(&body, "ethereum", "usd").unwrap().unwrap();
        assert_eq!(quote.change_24h, Some(1.25));
        assert!(quote.market_cap.is_some());
        assert!(parse_coingecko(&body, "bitcoin", "usd").unwrap().is_none());
    }

    #[test]
    fn test_token_lookup_from_config() {
        let config = Config::default();
        let feed = HttpPriceFeed::new(&config).unwrap();
        let weth: Address = crate::constants::WETH.parse().unwrap();

        assert_eq!(feed.get_token_address("weth"), Some(weth));
        assert_eq!(feed.get_token_symbol(weth), Some("WETH".to_string()));
        assert_eq!(feed.get_token_symbol(Address::zero()), None);
    }
}
