//! Instrument Types
//!
//! Contract specifications as configured, and the qualified form returned
//! by the broker once the specification has been resolved to a single
//! tradable contract.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broker-assigned contract identifier.
///
/// Positions and orders are matched on this identifier, never on the
/// symbol, because one symbol can map to several contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractId(i64);

impl ContractId {
    /// Create a contract identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw identifier value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Security type of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityType {
    /// Exchange-listed equity.
    #[serde(rename = "STK")]
    Stock,
    /// Dated future.
    #[serde(rename = "FUT")]
    Future,
    /// Continuous (front-month) future.
    #[serde(rename = "CONTFUT")]
    ContinuousFuture,
    /// Listed option.
    #[serde(rename = "OPT")]
    Option,
    /// Spot currency pair.
    #[serde(rename = "CASH")]
    Cash,
}

impl SecurityType {
    /// Broker code for the security type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stock => "STK",
            Self::Future => "FUT",
            Self::ContinuousFuture => "CONTFUT",
            Self::Option => "OPT",
            Self::Cash => "CASH",
        }
    }

    /// Whether the contract trades on an exchange (as opposed to spot/cash).
    #[must_use]
    pub const fn is_exchange_traded(&self) -> bool {
        !matches!(self, Self::Cash)
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract specification as it appears in configuration.
///
/// A specification may be ambiguous (no exchange, no expiry); the broker
/// resolves it to exactly one contract during qualification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Ticker or base currency.
    pub symbol: String,
    /// Security type.
    pub security_type: SecurityType,
    /// Routing exchange.
    #[serde(default)]
    pub exchange: Option<String>,
    /// Quote currency.
    #[serde(default)]
    pub currency: Option<String>,
    /// Expiry (`YYYYMM` or `YYYYMMDD`) for dated contracts.
    #[serde(default)]
    pub last_trade_date: Option<String>,
}

impl InstrumentSpec {
    /// Create a specification with only symbol and security type set.
    #[must_use]
    pub fn new(symbol: impl Into<String>, security_type: SecurityType) -> Self {
        Self {
            symbol: symbol.into(),
            security_type,
            exchange: None,
            currency: None,
            last_trade_date: None,
        }
    }

    /// Set the exchange.
    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Set the currency.
    #[must_use]
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    /// Spot currency pair, e.g. `forex("EURUSD")`.
    ///
    /// Six-letter pairs are split into symbol and currency; anything else is
    /// taken verbatim as the symbol.
    #[must_use]
    pub fn forex(pair: &str) -> Self {
        let spec = Self::new(pair, SecurityType::Cash).with_exchange("IDEALPRO");
        if pair.len() == 6 && pair.is_ascii() {
            let (base, quote) = pair.split_at(3);
            Self {
                symbol: base.to_string(),
                currency: Some(quote.to_string()),
                ..spec
            }
        } else {
            spec
        }
    }

    /// Short label used in logs: the symbol, plus the currency for cash pairs.
    #[must_use]
    pub fn label(&self) -> String {
        match (&self.security_type, &self.currency) {
            (SecurityType::Cash, Some(currency)) => format!("{}{currency}", self.symbol),
            _ => self.symbol.clone(),
        }
    }

    /// Whether `other` satisfies every field this specification sets.
    ///
    /// Unset optional fields match anything.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        fn field_matches(wanted: Option<&String>, actual: Option<&String>) -> bool {
            wanted.is_none_or(|w| actual.is_some_and(|a| a.eq_ignore_ascii_case(w)))
        }

        self.symbol.eq_ignore_ascii_case(&other.symbol)
            && self.security_type == other.security_type
            && field_matches(self.exchange.as_ref(), other.exchange.as_ref())
            && field_matches(self.currency.as_ref(), other.currency.as_ref())
            && field_matches(self.last_trade_date.as_ref(), other.last_trade_date.as_ref())
    }
}

/// A contract that the broker has resolved. Immutable once qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    contract_id: ContractId,
    spec: InstrumentSpec,
}

impl Instrument {
    /// Create a qualified instrument.
    #[must_use]
    pub const fn new(contract_id: ContractId, spec: InstrumentSpec) -> Self {
        Self { contract_id, spec }
    }

    /// Broker contract identifier.
    #[must_use]
    pub const fn contract_id(&self) -> ContractId {
        self.contract_id
    }

    /// Fully populated specification.
    #[must_use]
    pub const fn spec(&self) -> &InstrumentSpec {
        &self.spec
    }

    /// Security type.
    #[must_use]
    pub const fn security_type(&self) -> SecurityType {
        self.spec.security_type
    }

    /// Log label.
    #[must_use]
    pub fn label(&self) -> String {
        self.spec.label()
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (conId {})",
            self.spec.security_type,
            self.label(),
            self.contract_id
        )
    }
}
