//! Framework-agnostic domain types for the payment engine.

/// Raised when a stored string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a string-backed enum with `as_str`, `FromStr` and `Display`,
/// matching the upper-case spelling stored in the database.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident as $label:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::domain::UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::domain::UnknownVariant {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub mod money;
pub mod order;
pub mod outbox;
pub mod settlement;
pub mod transaction;
pub mod wallet;

pub use order::{Order, OrderStatus, PaymentStatus};
pub use outbox::{OutboxCommand, OutboxMessage, WebhookFailure};
pub use settlement::{Settlement, SettlementMode, SettlementSplit, SettlementStatus};
pub use transaction::{Flow, ProposedTransaction, Transaction, TransactionStatus, TransactionType};
pub use wallet::{BankAccount, Party, PartyKind, PayoutProfile, PayoutSchedule, Wallet, WalletState};
