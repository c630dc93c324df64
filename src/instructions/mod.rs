pub mod compute_budget;
pub mod tip;

pub use compute_budget::{
    COMPUTE_BUDGET_PROGRAM_ID, compute_budget_sequence, compute_unit_limit_instruction,
    compute_unit_price_instruction, declared_unit_limit, is_compute_budget,
};
pub use tip::{TIP_WALLETS, random_tip_wallet, tip_transfer_instruction};
