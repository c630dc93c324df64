//! 优先费的 UI(SOL) 与 micro-lamports/CU 换算，带 0.1 SOL 总额封顶。

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;
pub const DEFAULT_CU_LIMIT: u32 = 1_400_000;

/// 单笔交易优先费的硬性封顶（SOL）。
pub const MAX_PRIORITY_FEE_UI: f64 = 0.1;

pub fn ui_to_micro_lamports(ui: f64, cu_limit: u32) -> u64 {
    if ui <= 0.0 || cu_limit == 0 {
        return 0;
    }
    let micro_total = ui * LAMPORTS_PER_SOL as f64 * 1_000_000.0;
    (micro_total / cu_limit as f64).round() as u64
}

/// 截断到 9 位小数，避免浮点尾数污染展示值。
pub fn micro_lamports_to_ui(micro_lamports: u64, cu_limit: u32) -> f64 {
    let micro_total = micro_lamports as f64 * cu_limit as f64;
    let ui = micro_total / (LAMPORTS_PER_SOL as f64 * 1_000_000.0);
    (ui * LAMPORTS_PER_SOL as f64).trunc() / LAMPORTS_PER_SOL as f64
}

/// 把请求的费率夹到封顶之内：总费用先按可选的 max_cap_ui 截断，
/// 再套 0.1 SOL 的硬上限。
pub fn clamp_priority_fee_micro(micro_lamports: u64, cu_limit: u32, max_cap_ui: Option<f64>) -> u64 {
    if micro_lamports == 0 || cu_limit == 0 {
        return 0;
    }

    let mut fee_ui = micro_lamports_to_ui(micro_lamports, cu_limit);
    if let Some(cap) = max_cap_ui {
        fee_ui = fee_ui.min(cap);
    }
    if fee_ui > MAX_PRIORITY_FEE_UI {
        fee_ui = MAX_PRIORITY_FEE_UI;
    }

    ui_to_micro_lamports(fee_ui, cu_limit)
}

pub fn sol_to_lamports(ui: f64) -> u64 {
    if !ui.is_finite() || ui <= 0.0 {
        return 0;
    }
    let lamports = (ui * LAMPORTS_PER_SOL as f64).round();
    if lamports >= u64::MAX as f64 {
        u64::MAX
    } else {
        lamports as u64
    }
}
