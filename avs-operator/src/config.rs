//! Command-line and environment configuration.
//!
//! Every option can be given as a flag or through its environment variable.
//! Validation turns raw values into the library's configuration types and
//! reports missing or malformed values as [`AvsError::Configuration`].

use avs_core::{
    AvsError, EthLedgerConfig, OperatorConfig, ReconnectPolicy, RetryPolicy, Signer,
};
use avs_core::ledger::{DEFAULT_GAS_LIMIT, DEFAULT_LOG_RANGE};
use clap::Args;
use ethers::types::Address;
use std::path::PathBuf;
use std::time::Duration;

/// Chain connection.
#[derive(Args, Debug, Clone)]
pub struct LedgerArgs {
    /// WebSocket RPC endpoint
    #[arg(long, env = "AVS_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Service-manager contract address
    #[arg(long, env = "AVS_CONTRACT_ADDRESS")]
    pub contract_address: Option<String>,

    /// Gas limit for createNewTask and respondToTask
    #[arg(long, env = "AVS_GAS_LIMIT", default_value_t = DEFAULT_GAS_LIMIT)]
    pub gas_limit: u64,

    /// Seconds to wait for a transaction to be included
    #[arg(long, env = "AVS_CONFIRMATION_TIMEOUT_SECS", default_value_t = 120)]
    pub confirmation_timeout_secs: u64,

    /// First block to replay tasks from, and to search for past responses
    #[arg(long, env = "AVS_START_BLOCK")]
    pub start_block: Option<u64>,

    /// Most blocks requested per log query
    #[arg(long, env = "AVS_LOG_RANGE", default_value_t = DEFAULT_LOG_RANGE)]
    pub log_range: u64,
}

impl LedgerArgs {
    pub fn ledger_config(&self) -> Result<EthLedgerConfig, AvsError> {
        let rpc_url = required("AVS_RPC_URL", self.rpc_url.as_deref())?;
        if !(rpc_url.starts_with("ws://") || rpc_url.starts_with("wss://")) {
            return Err(AvsError::Configuration(format!(
                "AVS_RPC_URL must be a ws:// or wss:// endpoint, got {}",
                rpc_url
            )));
        }

        let contract_address = parse_address(
            "AVS_CONTRACT_ADDRESS",
            required("AVS_CONTRACT_ADDRESS", self.contract_address.as_deref())?,
        )?;

        if self.gas_limit == 0 {
            return Err(AvsError::Configuration("AVS_GAS_LIMIT must be positive".to_string()));
        }
        if self.log_range == 0 {
            return Err(AvsError::Configuration("AVS_LOG_RANGE must be positive".to_string()));
        }

        Ok(EthLedgerConfig {
            rpc_url: rpc_url.to_string(),
            contract_address,
            gas_limit: self.gas_limit,
            deploy_block: self.start_block.unwrap_or(0),
            log_range: self.log_range,
        })
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

/// Operator service options.
#[derive(Args, Debug, Clone)]
pub struct OperatorArgs {
    /// Operator private key (hex)
    #[arg(long, env = "OPERATOR_PRIVATE_KEY", hide_env_values = true)]
    pub operator_private_key: Option<String>,

    /// Total respondToTask attempts per task
    #[arg(long, env = "AVS_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Delay between respondToTask attempts
    #[arg(long, env = "AVS_RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// Delay multiplier after each failed attempt (1.0 = fixed delay)
    #[arg(long, env = "AVS_RETRY_BACKOFF", default_value_t = 1.0)]
    pub retry_backoff: f64,

    /// Event reconnects before giving up (0 = stop on the first drop)
    #[arg(long, env = "AVS_RECONNECTS", default_value_t = 5)]
    pub reconnects: u32,

    /// Delay before each event reconnect
    #[arg(long, env = "AVS_RECONNECT_DELAY_MS", default_value_t = 2000)]
    pub reconnect_delay_ms: u64,

    /// Processing journal file
    #[arg(long, env = "AVS_JOURNAL", default_value = "avs-operator.journal")]
    pub journal: PathBuf,
}

impl OperatorArgs {
    pub fn signer(&self) -> Result<Signer, AvsError> {
        Ok(Signer::from_optional_key(
            "OPERATOR_PRIVATE_KEY",
            self.operator_private_key.as_deref(),
        )?)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, AvsError> {
        if self.retry_attempts == 0 {
            return Err(AvsError::Configuration(
                "AVS_RETRY_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if !self.retry_backoff.is_finite() || self.retry_backoff < 1.0 {
            return Err(AvsError::Configuration(format!(
                "AVS_RETRY_BACKOFF must be >= 1.0, got {}",
                self.retry_backoff
            )));
        }

        Ok(RetryPolicy {
            max_attempts: self.retry_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
            backoff: self.retry_backoff,
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_reconnects: Some(self.reconnects),
            delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn operator_config(&self, ledger: &LedgerArgs) -> Result<OperatorConfig, AvsError> {
        Ok(OperatorConfig {
            retry: self.retry_policy()?,
            reconnect: self.reconnect_policy(),
            confirmation_timeout: ledger.confirmation_timeout(),
            start_block: ledger.start_block,
        })
    }
}

/// AI identity options.
#[derive(Args, Debug, Clone)]
pub struct AiArgs {
    /// AI private key (hex)
    #[arg(long, env = "AI_PRIVATE_KEY", hide_env_values = true)]
    pub ai_private_key: Option<String>,
}

impl AiArgs {
    pub fn signer(&self) -> Result<Signer, AvsError> {
        Ok(Signer::from_optional_key("AI_PRIVATE_KEY", self.ai_private_key.as_deref())?)
    }
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, AvsError> {
    match value.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(AvsError::Configuration(format!("{} is not set", name))),
    }
}

pub fn parse_address(name: &str, value: &str) -> Result<Address, AvsError> {
    value
        .parse::<Address>()
        .map_err(|e| AvsError::Configuration(format!("{} is not a valid address ({}): {}", name, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use avs_core::KeyError;

    fn ledger_args() -> LedgerArgs {
        LedgerArgs {
            rpc_url: Some("ws://localhost:8545".to_string()),
            contract_address: Some("0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string()),
            gas_limit: DEFAULT_GAS_LIMIT,
            confirmation_timeout_secs: 120,
            start_block: None,
            log_range: DEFAULT_LOG_RANGE,
        }
    }

    fn operator_args() -> OperatorArgs {
        OperatorArgs {
            operator_private_key: None,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            retry_backoff: 1.0,
            reconnects: 5,
            reconnect_delay_ms: 2000,
            journal: PathBuf::from("avs-operator.journal"),
        }
    }

    #[test]
    fn test_ledger_config() {
        let args = LedgerArgs {
            start_block: Some(17),
            ..ledger_args()
        };
        let config = args.ledger_config().unwrap();

        assert_eq!(config.rpc_url, "ws://localhost:8545");
        assert_eq!(
            config.contract_address,
            "0x5FbDB2315678afecb367f032d93F642f64180aa3".parse::<Address>().unwrap()
        );
        assert_eq!(config.gas_limit, 500_000);
        assert_eq!(config.deploy_block, 17);
        assert_eq!(config.log_range, DEFAULT_LOG_RANGE);
    }

    #[test]
    fn test_zero_log_range_rejected() {
        let args = LedgerArgs {
            log_range: 0,
            ..ledger_args()
        };
        assert!(matches!(
            args.ledger_config(),
            Err(AvsError::Configuration(msg)) if msg.contains("AVS_LOG_RANGE")
        ));
    }

    #[test]
    fn test_missing_rpc_url() {
        for rpc_url in [None, Some("  ".to_string())] {
            let args = LedgerArgs {
                rpc_url,
                ..ledger_args()
            };
            assert!(matches!(
                args.ledger_config(),
                Err(AvsError::Configuration(msg)) if msg.contains("AVS_RPC_URL")
            ));
        }
    }

    #[test]
    fn test_http_endpoint_rejected() {
        let args = LedgerArgs {
            rpc_url: Some("http://localhost:8545".to_string()),
            ..ledger_args()
        };
        assert!(matches!(args.ledger_config(), Err(AvsError::Configuration(_))));
    }

    #[test]
    fn test_bad_contract_address() {
        let args = LedgerArgs {
            contract_address: Some("0x1234".to_string()),
            ..ledger_args()
        };
        assert!(matches!(
            args.ledger_config(),
            Err(AvsError::Configuration(msg)) if msg.contains("AVS_CONTRACT_ADDRESS")
        ));
    }

    #[test]
    fn test_missing_operator_key() {
        let result = operator_args().signer();
        assert!(matches!(
            result,
            Err(AvsError::Key(KeyError::Missing("OPERATOR_PRIVATE_KEY")))
        ));
    }

    #[test]
    fn test_operator_config_defaults() {
        let config = operator_args().operator_config(&ledger_args()).unwrap();
        let defaults = OperatorConfig::default();

        assert_eq!(config.retry, defaults.retry);
        assert_eq!(config.reconnect, defaults.reconnect);
        assert_eq!(config.confirmation_timeout, defaults.confirmation_timeout);
        assert_eq!(config.start_block, None);
    }

    #[test]
    fn test_invalid_retry_settings() {
        let zero_attempts = OperatorArgs {
            retry_attempts: 0,
            ..operator_args()
        };
        assert!(zero_attempts.retry_policy().is_err());

        let shrinking = OperatorArgs {
            retry_backoff: 0.5,
            ..operator_args()
        };
        assert!(shrinking.retry_policy().is_err());
    }
}
