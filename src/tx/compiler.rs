//! 交易编译：checkpoint 锚定、查找表解析、版本化交易解包与重编译。

use std::collections::HashMap;
use std::sync::Arc;

use bincode::config::standard;
use bincode::serde::encode_to_vec;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::message::compiled_instruction::CompiledInstruction;
use solana_sdk::message::v0::Message as V0Message;
use solana_sdk::message::{AddressLookupTableAccount, MessageHeader, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::transaction::VersionedTransaction;
use solana_address_lookup_table_interface::state::AddressLookupTable;
use tracing::debug;

use crate::tx::decorator::MAX_TX_BYTES;
use crate::tx::{BuildError, SubmittableTransaction, TransactionKind};

/// 编译后重试时 minContextSlot 回退的槽位数。
pub const CONTEXT_SLOT_LAG: u64 = 4;

/// 一次批量共享的区块锚点，批内所有交易用同一份。
#[derive(Debug, Clone, Copy)]
pub struct CheckpointAnchor {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
    pub slot: u64,
}

impl CheckpointAnchor {
    pub fn min_context_slot(&self) -> u64 {
        self.slot.saturating_sub(CONTEXT_SLOT_LAG)
    }
}

/// 编译并签名完成的交易，wire_bytes 已可直接投递。
#[derive(Debug, Clone)]
pub struct CompiledTransaction {
    pub transaction: VersionedTransaction,
    pub serialized_size: usize,
    pub wire_bytes: Vec<u8>,
}

impl CompiledTransaction {
    pub fn signature(&self) -> Signature {
        self.transaction
            .signatures
            .first()
            .copied()
            .unwrap_or_default()
    }
}

pub struct TransactionCompiler {
    rpc: Arc<RpcClient>,
    commitment: CommitmentConfig,
}

impl TransactionCompiler {
    pub fn new(rpc: Arc<RpcClient>, commitment: CommitmentConfig) -> Self {
        Self { rpc, commitment }
    }

    pub async fn fetch_checkpoint(&self) -> Result<CheckpointAnchor, BuildError> {
        let (blockhash, last_valid_block_height) = self
            .rpc
            .get_latest_blockhash_with_commitment(self.commitment)
            .await
            .map_err(BuildError::Checkpoint)?;
        let slot = self
            .rpc
            .get_slot()
            .await
            .map_err(BuildError::Checkpoint)?;
        debug!(
            target: "tx::compiler",
            %blockhash,
            last_valid_block_height,
            slot,
            "checkpoint 已锚定"
        );
        Ok(CheckpointAnchor {
            blockhash,
            last_valid_block_height,
            slot,
        })
    }

    /// 解析批内引用到的所有查找表。解析失败直接报错，
    /// 缺表会让版本化交易解包产生错误账户。
    pub async fn resolve_lookup_tables(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<AddressLookupTableAccount>, BuildError> {
        let mut tables = Vec::with_capacity(addresses.len());
        for address in addresses {
            let account = self.rpc.get_account(address).await.map_err(|source| {
                BuildError::LookupTableFetch {
                    address: *address,
                    source,
                }
            })?;
            let table = AddressLookupTable::deserialize(&account.data).map_err(|err| {
                BuildError::LookupTableDecode {
                    address: *address,
                    message: err.to_string(),
                }
            })?;
            tables.push(AddressLookupTableAccount {
                key: *address,
                addresses: table.addresses.into_owned(),
            });
        }
        Ok(tables)
    }

    /// 取出交易的指令序列。版本化交易先按查找表解包。
    pub fn instructions_of(
        &self,
        tx: &SubmittableTransaction,
        tables: &[AddressLookupTableAccount],
    ) -> Result<Vec<Instruction>, BuildError> {
        match &tx.kind {
            TransactionKind::Versioned(versioned) => decompile(&versioned.message, tables),
            _ => Ok(tx.instructions.clone()),
        }
    }

    /// 注入指令在前、原指令在后，最后统一签名。
    pub fn compile(
        &self,
        index: usize,
        tx: &SubmittableTransaction,
        prefix: &[Instruction],
        tables: &[AddressLookupTableAccount],
        checkpoint: &CheckpointAnchor,
        fee_payer: &Keypair,
    ) -> Result<CompiledTransaction, BuildError> {
        let originals = self.instructions_of(tx, tables)?;
        let mut ordered = Vec::with_capacity(prefix.len() + originals.len());
        ordered.extend_from_slice(prefix);
        ordered.extend(originals);

        self.compile_instructions(index, &ordered, &tx.signers, tables, checkpoint, fee_payer)
    }

    pub fn compile_instructions(
        &self,
        index: usize,
        instructions: &[Instruction],
        co_signers: &[Arc<Keypair>],
        tables: &[AddressLookupTableAccount],
        checkpoint: &CheckpointAnchor,
        fee_payer: &Keypair,
    ) -> Result<CompiledTransaction, BuildError> {
        let message = compile_message(
            &fee_payer.pubkey(),
            instructions,
            tables,
            checkpoint.blockhash,
        )?;

        let mut signers: Vec<&dyn Signer> = Vec::with_capacity(1 + co_signers.len());
        signers.push(fee_payer);
        for signer in co_signers {
            signers.push(signer.as_ref());
        }

        let transaction = VersionedTransaction::try_new(VersionedMessage::V0(message), &signers)?;
        let wire_bytes = encode_to_vec(&transaction, standard())?;
        let serialized_size = wire_bytes.len();
        if serialized_size > MAX_TX_BYTES {
            return Err(BuildError::Oversize {
                index,
                size: serialized_size,
                limit: MAX_TX_BYTES,
            });
        }

        Ok(CompiledTransaction {
            transaction,
            serialized_size,
            wire_bytes,
        })
    }
}

fn compile_message(
    payer: &Pubkey,
    instructions: &[Instruction],
    tables: &[AddressLookupTableAccount],
    blockhash: Hash,
) -> Result<V0Message, BuildError> {
    V0Message::try_compile(payer, instructions, tables, blockhash)
        .map_err(|err| BuildError::Compile(err.to_string()))
}

/// 把已编译消息还原成指令列表，顺序与账户读写属性保持不变。
pub fn decompile(
    message: &VersionedMessage,
    tables: &[AddressLookupTableAccount],
) -> Result<Vec<Instruction>, BuildError> {
    let account_keys = build_account_keys(message, tables)?;
    let compiled = match message {
        VersionedMessage::Legacy(legacy) => &legacy.instructions,
        VersionedMessage::V0(v0) => &v0.instructions,
    };
    compiled
        .iter()
        .map(|ix| convert_instruction(ix, &account_keys))
        .collect()
}

#[derive(Debug, Clone)]
struct AccountKeyInfo {
    pubkey: Pubkey,
    is_signer: bool,
    is_writable: bool,
}

fn build_account_keys(
    message: &VersionedMessage,
    tables: &[AddressLookupTableAccount],
) -> Result<Vec<AccountKeyInfo>, BuildError> {
    match message {
        VersionedMessage::Legacy(legacy) => {
            let total = legacy.account_keys.len();
            Ok(legacy
                .account_keys
                .iter()
                .enumerate()
                .map(|(idx, pubkey)| AccountKeyInfo {
                    pubkey: *pubkey,
                    is_signer: is_signer(idx, &legacy.header),
                    is_writable: is_writable(idx, &legacy.header, total),
                })
                .collect())
        }
        VersionedMessage::V0(v0) => {
            let static_total = v0.account_keys.len();
            let mut infos: Vec<AccountKeyInfo> = v0
                .account_keys
                .iter()
                .enumerate()
                .map(|(idx, pubkey)| AccountKeyInfo {
                    pubkey: *pubkey,
                    is_signer: is_signer(idx, &v0.header),
                    is_writable: is_writable(idx, &v0.header, static_total),
                })
                .collect();

            if v0.address_table_lookups.is_empty() {
                return Ok(infos);
            }

            let table_map: HashMap<Pubkey, &AddressLookupTableAccount> =
                tables.iter().map(|table| (table.key, table)).collect();

            // 先 writable 后 readonly，与运行时装载顺序一致。
            for writable in [true, false] {
                for lookup in &v0.address_table_lookups {
                    let table = table_map
                        .get(&lookup.account_key)
                        .copied()
                        .ok_or(BuildError::LookupTableMissing(lookup.account_key))?;
                    let indexes = if writable {
                        &lookup.writable_indexes
                    } else {
                        &lookup.readonly_indexes
                    };
                    for index in indexes {
                        let address = table.addresses.get(*index as usize).ok_or(
                            BuildError::AccountIndexOutOfBounds {
                                index: *index as usize,
                                total: table.addresses.len(),
                            },
                        )?;
                        infos.push(AccountKeyInfo {
                            pubkey: *address,
                            is_signer: false,
                            is_writable: writable,
                        });
                    }
                }
            }

            Ok(infos)
        }
    }
}

fn convert_instruction(
    ix: &CompiledInstruction,
    account_keys: &[AccountKeyInfo],
) -> Result<Instruction, BuildError> {
    let program_index = ix.program_id_index as usize;
    let program =
        account_keys
            .get(program_index)
            .ok_or(BuildError::AccountIndexOutOfBounds {
                index: program_index,
                total: account_keys.len(),
            })?;

    let mut accounts = Vec::with_capacity(ix.accounts.len());
    for account_index in &ix.accounts {
        let idx = *account_index as usize;
        let info = account_keys
            .get(idx)
            .ok_or(BuildError::AccountIndexOutOfBounds {
                index: idx,
                total: account_keys.len(),
            })?;
        accounts.push(AccountMeta {
            pubkey: info.pubkey,
            is_signer: info.is_signer,
            is_writable: info.is_writable,
        });
    }

    Ok(Instruction {
        program_id: program.pubkey,
        accounts,
        data: ix.data.clone(),
    })
}

fn is_signer(index: usize, header: &MessageHeader) -> bool {
    index < header.num_required_signatures as usize
}

fn is_writable(index: usize, header: &MessageHeader, total_keys: usize) -> bool {
    let num_required = header.num_required_signatures as usize;
    let writable_signed = num_required.saturating_sub(header.num_readonly_signed_accounts as usize);
    if index < num_required {
        return index < writable_signed;
    }

    let num_unsigned = total_keys.saturating_sub(num_required);
    let writable_unsigned =
        num_unsigned.saturating_sub(header.num_readonly_unsigned_accounts as usize);
    index.saturating_sub(num_required) < writable_unsigned
}
