pub mod core {
    pub mod config;
    pub mod error;
    pub mod registry;
    pub mod types;
}

pub mod math {
    pub mod fraction;
}

pub mod protocol;

pub mod blockchain {
    pub mod rpc_client;
    pub mod transaction;
}

pub mod engine {
    pub mod action;
    pub mod market;
    pub mod obligation;
    pub mod obligation_order;
    pub mod reserve;
}

pub mod utils {
    pub mod ata_manager;
}

pub use blockchain::{rpc_client, transaction};
pub use core::{config, error, registry, types};
pub use engine::action::{ActionOptions, ActionPlan, ObligationSource, ObligationType, Phase, TokenLeg};
pub use engine::{market::KaminoMarket, obligation::KaminoObligation, reserve::KaminoReserve};
pub use utils::ata_manager;
