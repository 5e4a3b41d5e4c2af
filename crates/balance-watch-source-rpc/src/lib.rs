#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use balance_watch_core::{BalanceSource, WatchError};
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Decimal places between lamports and SOL.
pub const LAMPORT_SCALE: u32 = 9;

/// Reads native SOL balances through the JSON-RPC `getBalance` method.
#[derive(Debug, Clone)]
pub struct SolanaRpcSource {
    url: String,
    timeout_ms: u64,
}

impl Default for SolanaRpcSource {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_URL, DEFAULT_TIMEOUT_MS)
    }
}

impl SolanaRpcSource {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            url: url.into(),
            timeout_ms,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl BalanceSource for SolanaRpcSource {
    fn source_name(&self) -> &'static str {
        "solana_rpc"
    }

    fn current_balance(&self, address: &str) -> Result<Decimal, WatchError> {
        if address.trim().is_empty() {
            return Err(WatchError::SourceUnavailable(
                "wallet address is empty".to_string(),
            ));
        }

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build();

        log::debug!("getBalance address={address} url={}", self.url);
        let body: Value = match agent
            .post(&self.url)
            .set("content-type", "application/json")
            .send_json(build_get_balance_request(address))
        {
            Ok(response) => response.into_json().map_err(|err| {
                WatchError::SourceUnavailable(format!("invalid JSON-RPC response body: {err}"))
            })?,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                return Err(WatchError::SourceUnavailable(format!(
                    "http status {code}: {}",
                    detail.trim()
                )));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(WatchError::SourceUnavailable(format!(
                    "http transport failure: {err}"
                )));
            }
        };

        let balance = parse_get_balance_response(&body)?;
        log::debug!("getBalance address={address} balance={balance}");
        Ok(balance)
    }
}

#[must_use]
pub fn build_get_balance_request(address: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "getBalance",
        "params": [address],
    })
}

/// Extracts the SOL balance from a `getBalance` response body.
///
/// # Errors
/// Returns [`WatchError::SourceUnavailable`] when the body carries a JSON-RPC
/// error object or lacks an integer `result.value`.
pub fn parse_get_balance_response(body: &Value) -> Result<Decimal, WatchError> {
    if let Some(error) = body.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .map_or_else(|| "?".to_string(), |code| code.to_string());
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message");
        return Err(WatchError::SourceUnavailable(format!(
            "rpc error {code}: {message}"
        )));
    }

    body.pointer("/result/value")
        .and_then(Value::as_u64)
        .map(lamports_to_sol)
        .ok_or_else(|| {
            WatchError::SourceUnavailable("rpc response is missing result.value".to_string())
        })
}

#[must_use]
pub fn lamports_to_sol(lamports: u64) -> Decimal {
    Decimal::from_i128_with_scale(i128::from(lamports), LAMPORT_SCALE)
}

/// Replays a fixed script of balances and failures, one per call.
///
/// Used for dry runs and tests; an exhausted script reports the source as
/// unavailable.
#[derive(Debug, Default)]
pub struct ScriptedBalanceSource {
    script: Mutex<VecDeque<Result<Decimal, WatchError>>>,
    calls: AtomicUsize,
}

impl ScriptedBalanceSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_balances(balances: impl IntoIterator<Item = Decimal>) -> Self {
        let source = Self::new();
        for balance in balances {
            source.push_balance(balance);
        }
        source
    }

    pub fn push_balance(&self, balance: Decimal) {
        self.push(Ok(balance));
    }

    pub fn push_failure(&self, message: &str) {
        self.push(Err(WatchError::SourceUnavailable(message.to_string())));
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, entry: Result<Decimal, WatchError>) {
        match self.script.lock() {
            Ok(mut script) => script.push_back(entry),
            Err(poisoned) => poisoned.into_inner().push_back(entry),
        }
    }
}

impl BalanceSource for ScriptedBalanceSource {
    fn source_name(&self) -> &'static str {
        "scripted"
    }

    fn current_balance(&self, _address: &str) -> Result<Decimal, WatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = match self.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.unwrap_or_else(|| {
            Err(WatchError::SourceUnavailable(
                "scripted source is exhausted".to_string(),
            ))
        })
    }
}
