use std::env;

/// API key/secret pair for one exchange account. Treated as opaque values;
/// never logged.
#[derive(Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BinanceFuturesConfig {
    pub credentials: ExchangeCredentials,
    pub account_id: String,
    pub base_url: String,
}

impl BinanceFuturesConfig {
    pub fn new(credentials: ExchangeCredentials) -> Self {
        Self {
            credentials,
            account_id: "futures".to_string(),
            base_url: "https://fapi.binance.com".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BinancePortfolioConfig {
    pub credentials: ExchangeCredentials,
    pub account_id: String,
    pub base_url: String,
    /// USD-M market-data host, used for premium-index funding rates; papi
    /// itself exposes no market data.
    pub market_data_url: String,
}

impl BinancePortfolioConfig {
    pub fn new(credentials: ExchangeCredentials) -> Self {
        Self {
            credentials,
            account_id: "portfolio".to_string(),
            base_url: "https://papi.binance.com".to_string(),
            market_data_url: "https://fapi.binance.com".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BybitUnifiedConfig {
    pub credentials: ExchangeCredentials,
    pub account_id: String,
    pub base_url: String,
    pub recv_window: u64,
}

impl BybitUnifiedConfig {
    pub fn new(credentials: ExchangeCredentials) -> Self {
        Self {
            credentials,
            account_id: "unified".to_string(),
            base_url: "https://api.bybit.com".to_string(),
            recv_window: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Seconds between fetch cycles.
    pub poll_interval_secs: u64,
    /// Per-request timeout applied to every exchange call.
    pub timeout_ms: u64,
    pub binance_futures: Option<BinanceFuturesConfig>,
    pub binance_portfolio: Option<BinancePortfolioConfig>,
    pub bybit_unified: Option<BybitUnifiedConfig>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            timeout_ms: 10_000,
            binance_futures: None,
            binance_portfolio: None,
            bybit_unified: None,
        }
    }
}

impl AggregatorConfig {
    /// Build a config from environment variables. An exchange is enabled by
    /// the presence of its key/secret pair; base URLs can be overridden for
    /// testnets.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(secs) = env::var("POLL_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                config.poll_interval_secs = secs;
            }
        }

        if let Some(credentials) =
            credentials_from_env("BINANCE_FUTURES_API_KEY", "BINANCE_FUTURES_API_SECRET")
        {
            let mut binance = BinanceFuturesConfig::new(credentials);
            if let Ok(url) = env::var("BINANCE_FUTURES_BASE_URL") {
                binance.base_url = url;
            }
            config.binance_futures = Some(binance);
        }

        if let Some(credentials) =
            credentials_from_env("BINANCE_PORTFOLIO_API_KEY", "BINANCE_PORTFOLIO_API_SECRET")
        {
            let mut portfolio = BinancePortfolioConfig::new(credentials);
            if let Ok(url) = env::var("BINANCE_PORTFOLIO_BASE_URL") {
                portfolio.base_url = url;
            }
            config.binance_portfolio = Some(portfolio);
        }

        if let Some(credentials) = credentials_from_env("BYBIT_API_KEY", "BYBIT_API_SECRET") {
            let mut bybit = BybitUnifiedConfig::new(credentials);
            if let Ok(url) = env::var("BYBIT_BASE_URL") {
                bybit.base_url = url;
            }
            config.bybit_unified = Some(bybit);
        }

        config
    }
}

fn credentials_from_env(key_var: &str, secret_var: &str) -> Option<ExchangeCredentials> {
    match (env::var(key_var), env::var(secret_var)) {
        (Ok(api_key), Ok(api_secret)) if !api_key.is_empty() && !api_secret.is_empty() => {
            Some(ExchangeCredentials {
                api_key,
                api_secret,
            })
        }
        _ => None,
    }
}
