//! Core domain types shared by every component.

pub mod credits;
pub mod error;
pub mod model;
pub mod pricing;
pub mod provider;
pub mod tier;
pub mod usage;
pub mod user;

pub use credits::{DeductionOutcome, DetailedBalance, PurchasedBalance, SubscriptionBalance};
pub use error::{GatewayError, Result};
pub use model::{
    AccessStatus, LegacyInfo, ModelConstraints, ModelRecord, ParameterConstraint,
    TierRestrictionMode,
};
pub use pricing::{MultiplierStatus, TierMultiplier, VendorPricing};
pub use provider::Provider;
pub use tier::Tier;
pub use usage::{CreditBreakdown, DebitEntry, Operation, UsageRecord};
pub use user::UserProfile;
