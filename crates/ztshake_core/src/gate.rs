//! Policy gates evaluated inside the check critical section.
//!
//! Gates run in order and the first rejection wins. A rejection never
//! consumes a use; only a check where every gate passes does.

use std::fmt;

use tracing::info;

use crate::error::Result;
use crate::record::ConfigRecord;
use crate::token::{TokenVerifier, Verification};

/// Why a check was turned down. These are expected outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The receiver is not the session's destination.
    DestinationMismatch,
    /// The session's usage budget is spent.
    UsageExhausted,
    TokenExpired,
    TokenSignatureInvalid,
    TokenNotYetValid,
}

impl Rejection {
    /// True for the two policy rejections (as opposed to token rejections).
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            Rejection::DestinationMismatch | Rejection::UsageExhausted
        )
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Rejection::DestinationMismatch => "receiver does not match destination",
            Rejection::UsageExhausted => "maximum number of uses reached",
            Rejection::TokenExpired => "token expired",
            Rejection::TokenSignatureInvalid => "token signature invalid",
            Rejection::TokenNotYetValid => "token is not active yet (nbf)",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Reject(Rejection),
}

/// Everything a gate may look at.
pub struct GateContext<'a> {
    pub record: &'a ConfigRecord,
    pub token: &'a str,
    pub receiver: &'a str,
}

pub trait PolicyGate: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Err` only for fatal conditions; rejections are `Ok(Reject(..))`.
    fn evaluate(&self, ctx: &GateContext<'_>) -> Result<GateVerdict>;
}

/// Receiver identity must equal the record's destination.
pub struct DestinationGate;

impl PolicyGate for DestinationGate {
    fn name(&self) -> &'static str {
        "destination"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> Result<GateVerdict> {
        if ctx.receiver == ctx.record.destination {
            Ok(GateVerdict::Pass)
        } else {
            Ok(GateVerdict::Reject(Rejection::DestinationMismatch))
        }
    }
}

/// At least one use must remain.
pub struct UsageBudgetGate;

impl PolicyGate for UsageBudgetGate {
    fn name(&self) -> &'static str {
        "usage"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> Result<GateVerdict> {
        if ctx.record.is_exhausted() {
            Ok(GateVerdict::Reject(Rejection::UsageExhausted))
        } else {
            Ok(GateVerdict::Pass)
        }
    }
}

/// Signature, algorithm, expiry and not-before against the stored key.
pub struct TokenValidityGate;

impl PolicyGate for TokenValidityGate {
    fn name(&self) -> &'static str {
        "token"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> Result<GateVerdict> {
        let verdict = match TokenVerifier::verify(ctx.token, &ctx.record.public_key)? {
            Verification::Valid(_) => {
                info!("Token verified");
                GateVerdict::Pass
            }
            Verification::Expired => GateVerdict::Reject(Rejection::TokenExpired),
            Verification::SignatureInvalid => GateVerdict::Reject(Rejection::TokenSignatureInvalid),
            Verification::NotYetValid => GateVerdict::Reject(Rejection::TokenNotYetValid),
        };
        Ok(verdict)
    }
}

/// Destination, then usage budget, then token validity.
pub fn default_gates() -> Vec<Box<dyn PolicyGate>> {
    vec![
        Box::new(DestinationGate),
        Box::new(UsageBudgetGate),
        Box::new(TokenValidityGate),
    ]
}

/// Evaluate `gates` in order; the first rejection wins.
pub fn evaluate_gates(gates: &[Box<dyn PolicyGate>], ctx: &GateContext<'_>) -> Result<GateVerdict> {
    for gate in gates {
        if let GateVerdict::Reject(rejection) = gate.evaluate(ctx)? {
            info!("Gate {} rejected check: {}", gate.name(), rejection);
            return Ok(GateVerdict::Reject(rejection));
        }
    }
    Ok(GateVerdict::Pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Provenance;
    use crate::token::TokenIssuer;

    fn record_for(public_key: &str, max: u32) -> ConfigRecord {
        ConfigRecord::new(
            public_key.to_string(),
            "svc-b".to_string(),
            max,
            Provenance::default(),
        )
    }

    #[test]
    fn test_all_gates_pass() {
        let issued = TokenIssuer::issue("gatepass01", 5).unwrap();
        let record = record_for(&issued.public_key, 1);
        let ctx = GateContext {
            record: &record,
            token: &issued.token,
            receiver: "svc-b",
        };
        assert_eq!(evaluate_gates(&default_gates(), &ctx).unwrap(), GateVerdict::Pass);
    }

    #[test]
    fn test_destination_checked_before_token() {
        // Broken public key would be fatal if the token gate ran.
        let record = record_for("garbage", 1);
        let ctx = GateContext {
            record: &record,
            token: "whatever",
            receiver: "svc-c",
        };
        assert_eq!(
            evaluate_gates(&default_gates(), &ctx).unwrap(),
            GateVerdict::Reject(Rejection::DestinationMismatch)
        );
    }

    #[test]
    fn test_usage_checked_before_token() {
        let mut record = record_for("garbage", 1);
        record.usage_count = 1;
        let ctx = GateContext {
            record: &record,
            token: "whatever",
            receiver: "svc-b",
        };
        assert_eq!(
            evaluate_gates(&default_gates(), &ctx).unwrap(),
            GateVerdict::Reject(Rejection::UsageExhausted)
        );
    }

    #[test]
    fn test_custom_gate_list_without_destination() {
        let issued = TokenIssuer::issue("nodest0001", 5).unwrap();
        let record = record_for(&issued.public_key, 1);
        let gates: Vec<Box<dyn PolicyGate>> =
            vec![Box::new(UsageBudgetGate), Box::new(TokenValidityGate)];
        let ctx = GateContext {
            record: &record,
            token: &issued.token,
            receiver: "anyone",
        };
        assert_eq!(evaluate_gates(&gates, &ctx).unwrap(), GateVerdict::Pass);
    }

    #[test]
    fn test_rejection_kinds() {
        assert!(Rejection::UsageExhausted.is_policy());
        assert!(Rejection::DestinationMismatch.is_policy());
        assert!(!Rejection::TokenExpired.is_policy());
    }
}
