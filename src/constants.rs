use rust_decimal::Decimal;

// Gas limits
pub const DEFAULT_GAS_LIMIT: u64 = 100_000;
pub const ETH_TRANSFER_GAS: u64 = 21_000;
pub const MAX_GAS_LIMIT: u64 = 30_000_000;

/// estimate_gas 결과에 곱하는 버퍼 (20%)
pub const GAS_ESTIMATE_BUFFER: f64 = 1.2;

/// 취소 트랜잭션 가스 상향 비율
pub const GAS_RETRY_BUMP: f64 = 1.15;

// Gas price limits (in gwei)
pub const MIN_GAS_PRICE_GWEI: f64 = 1.0;
pub const DEFAULT_PRIORITY_FEE_GWEI: f64 = 2.0;

// Slippage tiers (congestion upper bound, tolerance %)
pub const SLIPPAGE_TIERS: [(f64, f64); 3] = [(0.3, 0.1), (0.6, 0.5), (0.8, 1.0)];
pub const SLIPPAGE_HIGH_CONGESTION: f64 = 2.0;
pub const MIN_SLIPPAGE_PCT: f64 = 0.05;
pub const MAX_SLIPPAGE_PCT: f64 = 5.0;

// Market heuristics
pub const LIQUIDITY_VOLUME_MULTIPLIER: u32 = 10;
pub const DEFAULT_VOLATILITY: f64 = 0.05;
pub const VOLATILITY_DIVISOR: f64 = 20.0;
pub const DEFAULT_LIQUIDITY_USD: u64 = 1_000_000;

/// 가격 피드 장애 시 사용하는 대체 가격 (USD)
pub fn fallback_price(symbol: &str) -> Option<Decimal> {
    let price = match symbol.to_uppercase().as_str() {
        "ETH" | "WETH" => dec(3400, 0),
        "BTC" | "WBTC" => dec(62000, 0),
        "USDT" | "USDC" | "DAI" => dec(1, 0),
        "LINK" => dec(15, 0),
        "UNI" => dec(8, 0),
        "AAVE" => dec(95, 0),
        "MATIC" => dec(60, 2),
        "CRV" => dec(55, 2),
        _ => return None,
    };
    Some(price)
}

/// 가격 피드 장애 시 사용하는 대체 24시간 거래량 (USD)
pub fn fallback_volume(symbol: &str) -> Option<Decimal> {
    let volume = match symbol.to_uppercase().as_str() {
        "ETH" | "WETH" => dec(5_000_000, 0),
        "BTC" | "WBTC" => dec(20_000_000, 0),
        "USDT" => dec(50_000_000, 0),
        "USDC" => dec(30_000_000, 0),
        "DAI" => dec(1_000_000, 0),
        "LINK" => dec(3_000_000, 0),
        "UNI" => dec(2_000_000, 0),
        "AAVE" => dec(1_500_000, 0),
        "MATIC" => dec(4_000_000, 0),
        "CRV" => dec(1_000_000, 0),
        _ => return None,
    };
    Some(volume)
}

fn dec(num: i64, scale: u32) -> Decimal {
    Decimal::new(num, scale)
}

// Common token addresses (mainnet)
pub const WETH: &str = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2";
pub const USDC: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
pub const USDT: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";
pub const DAI: &str = "0x6B175474E89094C44Da98b954EedeAC495271d0F";
pub const WBTC: &str = "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599";
