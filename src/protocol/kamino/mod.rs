pub mod accounts;
pub mod instructions;
pub mod types;

pub use types::{
    detect_account_type, KaminoAccount, KaminoAccountType, LendingMarket, Obligation, Reserve,
    UserMetadata,
};
