//! 费用与 tip 注入规划。在编译前根据草稿尺寸决定每笔交易
//! 前置哪些指令，保证注入后不超过链上体积上限。

use smallvec::SmallVec;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;

use crate::instructions::{
    compute_budget_sequence, declared_unit_limit, tip_transfer_instruction,
};
use crate::tx::fees::clamp_priority_fee_micro;
use crate::tx::{BuildError, SubmittableTransaction};

pub const MAX_TX_BYTES: usize = 1232;
pub const TIP_INSTRUCTION_BYTES: usize = 81;
pub const PRIORITY_INSTRUCTION_BYTES: usize = 44;

pub const CU_HEADROOM: u64 = 50_000;
pub const MAX_COMPUTE_UNITS: u32 = 1_400_000;
pub const DEFAULT_UNITS_PER_INSTRUCTION: u64 = 200_000;

/// bundle 通道的占位费率，只为让费用指令布局统一。
pub const BUNDLE_DUMMY_PRIORITY_MICRO: u64 = 1;

/// 通道的计费形态。直连按优先费竞价，bundle 按 tip 竞价。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelClass {
    Direct,
    Bundle,
}

pub struct DecorationRequest<'a> {
    pub channel: ChannelClass,
    pub fee_payer: Pubkey,
    /// 直连通道请求的优先费（micro-lamports/CU），夹紧后使用。
    pub priority_fee_micro: u64,
    /// bundle 通道的 tip 总额（lamports）。
    pub tip_lamports: u64,
    pub max_cap_ui: Option<f64>,
    pub transactions: &'a [SubmittableTransaction],
    /// 注入前的序列化尺寸草稿，与交易一一对应。
    pub sizes: &'a [usize],
    /// 模拟得到的消耗单位，缺失时按指令数估算。
    pub units: &'a [Option<u64>],
}

/// 单笔交易的注入结果，prefix 依次为 tip、priority、CU limit。
#[derive(Debug, Default, Clone)]
pub struct Decoration {
    pub prefix: SmallVec<[Instruction; 3]>,
    pub carries_tip: bool,
}

#[derive(Debug, Default)]
pub struct DecorationPlan {
    pub decorations: Vec<Decoration>,
    /// 没有交易能容纳 tip 时，tip 单独成交易追加到 bundle 末尾。
    pub standalone_tip: Option<Instruction>,
    pub tip_index: Option<usize>,
}

fn effective_unit_limit(units: Option<u64>, instruction_count: usize) -> u32 {
    let raw = match units {
        Some(consumed) => consumed.saturating_add(CU_HEADROOM),
        None => (instruction_count.max(1) as u64).saturating_mul(DEFAULT_UNITS_PER_INSTRUCTION),
    };
    raw.min(MAX_COMPUTE_UNITS as u64) as u32
}

/// 为一批交易规划注入。flashloan 交易体积自闭合，整体豁免。
pub fn plan(req: &DecorationRequest<'_>) -> Result<DecorationPlan, BuildError> {
    let mut tip_index = None;
    let mut standalone_tip = None;

    if req.channel == ChannelClass::Bundle {
        if req.tip_lamports == 0 {
            return Err(BuildError::MissingBundleTip);
        }
        // 首个能容纳 tip 指令的交易成为载体。
        for (index, tx) in req.transactions.iter().enumerate() {
            if tx.is_flashloan() {
                continue;
            }
            if req.sizes[index] + TIP_INSTRUCTION_BYTES < MAX_TX_BYTES {
                tip_index = Some(index);
                break;
            }
        }
        if tip_index.is_none() {
            standalone_tip = Some(
                tip_transfer_instruction(&req.fee_payer, req.tip_lamports)
                    .ok_or(BuildError::NoTipWallet)?,
            );
        }
    }

    let mut decorations = Vec::with_capacity(req.transactions.len());
    for (index, tx) in req.transactions.iter().enumerate() {
        let mut decoration = Decoration::default();
        if tx.is_flashloan() {
            decorations.push(decoration);
            continue;
        }

        let mut size = req.sizes[index];
        if tip_index == Some(index) {
            let tip = tip_transfer_instruction(&req.fee_payer, req.tip_lamports)
                .ok_or(BuildError::NoTipWallet)?;
            decoration.prefix.push(tip);
            decoration.carries_tip = true;
            size += TIP_INSTRUCTION_BYTES;
        }

        if size + PRIORITY_INSTRUCTION_BYTES < MAX_TX_BYTES {
            let declared = declared_unit_limit(&tx.instructions);
            let unit_limit = declared.unwrap_or_else(|| {
                effective_unit_limit(
                    req.units.get(index).copied().flatten(),
                    tx.instructions.len(),
                )
            });
            let micro = match req.channel {
                ChannelClass::Bundle => BUNDLE_DUMMY_PRIORITY_MICRO,
                ChannelClass::Direct => {
                    clamp_priority_fee_micro(req.priority_fee_micro, unit_limit, req.max_cap_ui)
                }
            };
            // 已自带 CU limit 的交易不重复声明。
            let limit_to_inject = if declared.is_some() { 0 } else { unit_limit };
            decoration
                .prefix
                .extend(compute_budget_sequence(micro, limit_to_inject));
        }

        decorations.push(decoration);
    }

    Ok(DecorationPlan {
        decorations,
        standalone_tip,
        tip_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::{COMPUTE_BUDGET_PROGRAM_ID, TIP_WALLETS, compute_unit_limit_instruction};
    use solana_sdk::instruction::AccountMeta;

    fn dummy_tx(instruction_count: usize) -> SubmittableTransaction {
        let ixs = (0..instruction_count)
            .map(|_| Instruction {
                program_id: Pubkey::new_unique(),
                accounts: vec![AccountMeta::new(Pubkey::new_unique(), false)],
                data: vec![0; 8],
            })
            .collect();
        SubmittableTransaction::standard(ixs)
    }

    fn plan_for(
        channel: ChannelClass,
        txs: &[SubmittableTransaction],
        sizes: &[usize],
        tip_lamports: u64,
    ) -> Result<DecorationPlan, BuildError> {
        let units = vec![None; txs.len()];
        plan(&DecorationRequest {
            channel,
            fee_payer: Pubkey::new_unique(),
            priority_fee_micro: 10_000,
            tip_lamports,
            max_cap_ui: None,
            transactions: txs,
            sizes,
            units: &units,
        })
    }

    #[test]
    fn bundle_without_tip_fails_fast() {
        let txs = vec![dummy_tx(1)];
        let err = plan_for(ChannelClass::Bundle, &txs, &[400], 0).unwrap_err();
        assert!(matches!(err, BuildError::MissingBundleTip));
    }

    #[test]
    fn first_fitting_transaction_carries_tip() {
        let txs = vec![dummy_tx(1), dummy_tx(1), dummy_tx(1)];
        // 第一笔放不下 tip 指令，第二笔成为载体。
        let sizes = [1200, 500, 500];
        let plan = plan_for(ChannelClass::Bundle, &txs, &sizes, 50_000).unwrap();
        assert_eq!(plan.tip_index, Some(1));
        assert!(plan.standalone_tip.is_none());
        assert!(plan.decorations[1].carries_tip);
        assert!(!plan.decorations[0].carries_tip);
        let carried = plan.decorations[1].prefix.first().unwrap();
        assert!(TIP_WALLETS.contains(&carried.accounts[1].pubkey));
    }

    #[test]
    fn tip_falls_back_to_standalone_transaction() {
        let txs = vec![dummy_tx(1), dummy_tx(1)];
        let sizes = [1210, 1225];
        let plan = plan_for(ChannelClass::Bundle, &txs, &sizes, 50_000).unwrap();
        assert_eq!(plan.tip_index, None);
        let tip = plan.standalone_tip.expect("standalone tip");
        assert!(TIP_WALLETS.contains(&tip.accounts[1].pubkey));
    }

    #[test]
    fn flashloan_is_exempt_even_when_alone() {
        let txs = vec![SubmittableTransaction::flashloan(dummy_tx(2).instructions)];
        let plan = plan_for(ChannelClass::Bundle, &txs, &[400], 50_000).unwrap();
        assert!(plan.decorations[0].prefix.is_empty());
        assert_eq!(plan.tip_index, None);
        assert!(plan.standalone_tip.is_some());
    }

    #[test]
    fn bundle_uses_dummy_priority_fee() {
        let txs = vec![dummy_tx(2)];
        let plan = plan_for(ChannelClass::Bundle, &txs, &[400], 50_000).unwrap();
        let deco = &plan.decorations[0];
        // tip, priority, cu limit
        assert_eq!(deco.prefix.len(), 3);
        let price_ix = &deco.prefix[1];
        assert_eq!(price_ix.program_id, COMPUTE_BUDGET_PROGRAM_ID);
        assert_eq!(price_ix.data[0], 3);
        assert_eq!(
            &price_ix.data[1..],
            &BUNDLE_DUMMY_PRIORITY_MICRO.to_le_bytes()
        );
    }

    #[test]
    fn direct_channel_skips_tip_and_clamps_fee() {
        let txs = vec![dummy_tx(2)];
        let plan = plan_for(ChannelClass::Direct, &txs, &[400], 0).unwrap();
        let deco = &plan.decorations[0];
        assert!(!deco.carries_tip);
        assert!(plan.standalone_tip.is_none());
        // priority + cu limit
        assert_eq!(deco.prefix.len(), 2);
        assert_eq!(deco.prefix[0].data[0], 3);
        assert_eq!(deco.prefix[1].data[0], 2);
    }

    #[test]
    fn oversized_transaction_gets_no_budget_block() {
        let txs = vec![dummy_tx(2)];
        let plan = plan_for(ChannelClass::Direct, &txs, &[1225], 0).unwrap();
        assert!(plan.decorations[0].prefix.is_empty());
    }

    #[test]
    fn declared_limit_is_not_duplicated() {
        let mut tx = dummy_tx(1);
        tx.instructions.insert(0, compute_unit_limit_instruction(777_000));
        let plan = plan_for(ChannelClass::Direct, std::slice::from_ref(&tx), &[400], 0).unwrap();
        let deco = &plan.decorations[0];
        assert_eq!(deco.prefix.len(), 1);
        assert_eq!(deco.prefix[0].data[0], 3);
    }

    #[test]
    fn unit_limit_uses_simulated_consumption() {
        let txs = vec![dummy_tx(1)];
        let plan = plan(&DecorationRequest {
            channel: ChannelClass::Direct,
            fee_payer: Pubkey::new_unique(),
            priority_fee_micro: 10_000,
            tip_lamports: 0,
            max_cap_ui: None,
            transactions: &txs,
            sizes: &[400],
            units: &[Some(100_000)],
        })
        .unwrap();
        let limit_ix = plan.decorations[0]
            .prefix
            .iter()
            .find(|ix| ix.data[0] == 2)
            .expect("cu limit instruction");
        let bytes: [u8; 4] = limit_ix.data[1..5].try_into().unwrap();
        assert_eq!(u32::from_le_bytes(bytes), 150_000);
    }

    #[test]
    fn unit_limit_is_capped() {
        assert_eq!(effective_unit_limit(Some(2_000_000), 1), MAX_COMPUTE_UNITS);
        assert_eq!(effective_unit_limit(None, 10), MAX_COMPUTE_UNITS);
        assert_eq!(effective_unit_limit(None, 3), 600_000);
    }
}
