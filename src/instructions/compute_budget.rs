use std::mem;

use once_cell::sync::Lazy;
use smallvec::SmallVec;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;

pub const COMPUTE_BUDGET_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("ComputeBudget111111111111111111111111111111");

/// 缓存键，用于复用 compute budget 指令组合。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ComputeBudgetKey {
    unit_price: u64,
    unit_limit: u32,
}

static CACHE: Lazy<dashmap::DashMap<ComputeBudgetKey, SmallVec<[Instruction; 2]>>> =
    Lazy::new(dashmap::DashMap::new);

pub fn compute_unit_limit_instruction(limit: u32) -> Instruction {
    let mut data = Vec::with_capacity(1 + mem::size_of::<u32>());
    data.push(2);
    data.extend_from_slice(&limit.to_le_bytes());
    Instruction {
        program_id: COMPUTE_BUDGET_PROGRAM_ID,
        accounts: Vec::new(),
        data,
    }
}

pub fn compute_unit_price_instruction(price_micro_lamports: u64) -> Instruction {
    let mut data = Vec::with_capacity(1 + mem::size_of::<u64>());
    data.push(3);
    data.extend_from_slice(&price_micro_lamports.to_le_bytes());
    Instruction {
        program_id: COMPUTE_BUDGET_PROGRAM_ID,
        accounts: Vec::new(),
        data,
    }
}

/// 根据参数生成一组 compute budget 指令，并做缓存。
pub fn compute_budget_sequence(unit_price: u64, unit_limit: u32) -> SmallVec<[Instruction; 2]> {
    let key = ComputeBudgetKey {
        unit_price,
        unit_limit,
    };

    if let Some(cached) = CACHE.get(&key) {
        return cached.clone();
    }

    let mut seq = SmallVec::<[Instruction; 2]>::new();
    if unit_price > 0 {
        seq.push(compute_unit_price_instruction(unit_price));
    }
    if unit_limit > 0 {
        seq.push(compute_unit_limit_instruction(unit_limit));
    }

    CACHE.insert(key, seq.clone());
    seq
}

pub fn is_compute_budget(ix: &Instruction) -> bool {
    ix.program_id == COMPUTE_BUDGET_PROGRAM_ID
}

/// 从指令列表中读取已声明的 compute unit limit（discriminant 2）。
pub fn declared_unit_limit(instructions: &[Instruction]) -> Option<u32> {
    instructions.iter().find_map(|ix| {
        if !is_compute_budget(ix) || ix.data.first() != Some(&2) {
            return None;
        }
        let bytes: [u8; 4] = ix.data.get(1..5)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    })
}
