// Copyright (c) 2024 Mergechain Foundation

//! Transactions, their typed payloads and the binary layout.
//!
//! A transaction serializes as:
//!
//! ```text
//! tx_type: u8 | payload_version: u8 | payload | attributes | inputs | outputs | lock_time: u32
//! | programs
//! ```
//!
//! Everything before `programs` is the unsigned form. The transaction hash is
//! the double SHA-256 of the unsigned form, so witnesses never change a
//! transaction's identity.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::address::ProgramHash;
use crate::asset::{Asset, Fixed64};
use crate::hash::{sha256d, short_hex, Hash256};
use crate::serialization::{
    read_list, read_u16, read_u32, read_u8, read_var_bytes, read_var_string, write_list,
    write_var_bytes, write_var_string, CodecError, Decode, Encode,
};

/// Reference to an output of an earlier transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: Hash256,
    pub index: u16,
}

impl OutPoint {
    pub fn new(tx_hash: Hash256, index: u16) -> Self {
        Self { tx_hash, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", short_hex(&self.tx_hash), self.index)
    }
}

impl Encode for OutPoint {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.tx_hash);
        buf.put_u16_le(self.index);
    }
}

impl Decode for OutPoint {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            tx_hash: Hash256::decode(buf)?,
            index: read_u16(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub previous: OutPoint,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(previous: OutPoint) -> Self {
        Self {
            previous,
            sequence: u32::MAX,
        }
    }
}

impl Encode for TxInput {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.previous.encode(buf);
        buf.put_u32_le(self.sequence);
    }
}

impl Decode for TxInput {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            previous: OutPoint::decode(buf)?,
            sequence: read_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub asset_id: Hash256,
    pub value: Fixed64,
    pub program_hash: ProgramHash,
}

impl Encode for TxOutput {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.asset_id);
        self.value.encode(buf);
        self.program_hash.encode(buf);
    }
}

impl Decode for TxOutput {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            asset_id: Hash256::decode(buf)?,
            value: Fixed64::decode(buf)?,
            program_hash: ProgramHash::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeUsage {
    Nonce = 0x00,
    Script = 0x20,
    Memo = 0x81,
    Description = 0x90,
    DescriptionUrl = 0x91,
}

impl TryFrom<u8> for AttributeUsage {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Nonce),
            0x20 => Ok(Self::Script),
            0x81 => Ok(Self::Memo),
            0x90 => Ok(Self::Description),
            0x91 => Ok(Self::DescriptionUrl),
            other => Err(CodecError::InvalidValue(format!(
                "unknown attribute usage 0x{:02x}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAttribute {
    pub usage: AttributeUsage,
    pub data: Vec<u8>,
}

impl Encode for TxAttribute {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.usage as u8);
        write_var_bytes(buf, &self.data);
    }
}

impl Decode for TxAttribute {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            usage: AttributeUsage::try_from(read_u8(buf)?)?,
            data: read_var_bytes(buf)?,
        })
    }
}

/// Witness data: the unlocking program and its parameters. Not covered by the
/// transaction hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub code: Vec<u8>,
    pub parameter: Vec<u8>,
}

impl Encode for Program {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        write_var_bytes(buf, &self.parameter);
        write_var_bytes(buf, &self.code);
    }
}

impl Decode for Program {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let parameter = read_var_bytes(buf)?;
        let code = read_var_bytes(buf)?;
        Ok(Self { code, parameter })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxType {
    CoinBase = 0x00,
    RegisterAsset = 0x01,
    IssueAsset = 0x02,
    TransferAsset = 0x80,
    Record = 0x81,
    DeployCode = 0xd0,
}

impl TryFrom<u8> for TxType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::CoinBase),
            0x01 => Ok(Self::RegisterAsset),
            0x02 => Ok(Self::IssueAsset),
            0x80 => Ok(Self::TransferAsset),
            0x81 => Ok(Self::Record),
            0xd0 => Ok(Self::DeployCode),
            other => Err(CodecError::InvalidValue(format!(
                "unknown transaction type 0x{:02x}",
                other
            ))),
        }
    }
}

/// Type-specific transaction content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    CoinBase {
        data: Vec<u8>,
    },
    RegisterAsset {
        asset: Asset,
        /// Maximum amount that may ever be issued
        amount: Fixed64,
        controller: ProgramHash,
    },
    IssueAsset,
    TransferAsset,
    Record {
        record_type: String,
        data: Vec<u8>,
    },
    DeployCode {
        code: Vec<u8>,
        name: String,
        code_version: String,
        author: String,
        email: String,
        description: String,
    },
}

impl Payload {
    pub fn tx_type(&self) -> TxType {
        match self {
            Payload::CoinBase { .. } => TxType::CoinBase,
            Payload::RegisterAsset { .. } => TxType::RegisterAsset,
            Payload::IssueAsset => TxType::IssueAsset,
            Payload::TransferAsset => TxType::TransferAsset,
            Payload::Record { .. } => TxType::Record,
            Payload::DeployCode { .. } => TxType::DeployCode,
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Payload::CoinBase { data } => write_var_bytes(buf, data),
            Payload::RegisterAsset {
                asset,
                amount,
                controller,
            } => {
                asset.encode(buf);
                amount.encode(buf);
                controller.encode(buf);
            }
            Payload::IssueAsset | Payload::TransferAsset => {}
            Payload::Record { record_type, data } => {
                write_var_string(buf, record_type);
                write_var_bytes(buf, data);
            }
            Payload::DeployCode {
                code,
                name,
                code_version,
                author,
                email,
                description,
            } => {
                write_var_bytes(buf, code);
                write_var_string(buf, name);
                write_var_string(buf, code_version);
                write_var_string(buf, author);
                write_var_string(buf, email);
                write_var_string(buf, description);
            }
        }
    }

    fn decode<B: Buf>(tx_type: TxType, buf: &mut B) -> Result<Self, CodecError> {
        Ok(match tx_type {
            TxType::CoinBase => Payload::CoinBase {
                data: read_var_bytes(buf)?,
            },
            TxType::RegisterAsset => Payload::RegisterAsset {
                asset: Asset::decode(buf)?,
                amount: Fixed64::decode(buf)?,
                controller: ProgramHash::decode(buf)?,
            },
            TxType::IssueAsset => Payload::IssueAsset,
            TxType::TransferAsset => Payload::TransferAsset,
            TxType::Record => Payload::Record {
                record_type: read_var_string(buf)?,
                data: read_var_bytes(buf)?,
            },
            TxType::DeployCode => Payload::DeployCode {
                code: read_var_bytes(buf)?,
                name: read_var_string(buf)?,
                code_version: read_var_string(buf)?,
                author: read_var_string(buf)?,
                email: read_var_string(buf)?,
                description: read_var_string(buf)?,
            },
        })
    }
}

/// Input and output totals of one asset within a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssetFlow {
    pub input: Fixed64,
    pub output: Fixed64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub payload_version: u8,
    pub payload: Payload,
    pub attributes: Vec<TxAttribute>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    pub programs: Vec<Program>,
}

impl Transaction {
    fn with_payload(payload: Payload) -> Self {
        Self {
            payload_version: 0,
            payload,
            attributes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            programs: Vec::new(),
        }
    }

    /// Create a coinbase. The height in the payload and the nonce attribute
    /// make every coinbase hash unique.
    pub fn new_coinbase(height: u32, nonce: u64, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self::with_payload(Payload::CoinBase {
            data: height.to_le_bytes().to_vec(),
        });
        tx.attributes.push(TxAttribute {
            usage: AttributeUsage::Nonce,
            data: nonce.to_le_bytes().to_vec(),
        });
        tx.outputs = outputs;
        tx
    }

    pub fn new_transfer(inputs: Vec<OutPoint>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self::with_payload(Payload::TransferAsset);
        tx.inputs = inputs.into_iter().map(TxInput::new).collect();
        tx.outputs = outputs;
        tx
    }

    pub fn new_register_asset(asset: Asset, amount: Fixed64, controller: ProgramHash) -> Self {
        Self::with_payload(Payload::RegisterAsset {
            asset,
            amount,
            controller,
        })
    }

    pub fn new_issue_asset(inputs: Vec<OutPoint>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self::with_payload(Payload::IssueAsset);
        tx.inputs = inputs.into_iter().map(TxInput::new).collect();
        tx.outputs = outputs;
        tx
    }

    pub fn new_record(record_type: &str, data: Vec<u8>) -> Self {
        Self::with_payload(Payload::Record {
            record_type: record_type.to_string(),
            data,
        })
    }

    /// Publish contract code. The metadata is recorded on chain; the code
    /// is not executed by this node.
    pub fn new_deploy_code(
        code: Vec<u8>,
        name: &str,
        code_version: &str,
        author: &str,
        email: &str,
        description: &str,
    ) -> Self {
        Self::with_payload(Payload::DeployCode {
            code,
            name: name.to_string(),
            code_version: code_version.to_string(),
            author: author.to_string(),
            email: email.to_string(),
            description: description.to_string(),
        })
    }

    pub fn tx_type(&self) -> TxType {
        self.payload.tx_type()
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.payload, Payload::CoinBase { .. })
    }

    /// Write the unsigned form (everything except programs).
    pub fn encode_unsigned<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.tx_type() as u8);
        buf.put_u8(self.payload_version);
        self.payload.encode(buf);
        write_list(buf, &self.attributes);
        write_list(buf, &self.inputs);
        write_list(buf, &self.outputs);
        buf.put_u32_le(self.lock_time);
    }

    /// Transaction identity: double SHA-256 of the unsigned form.
    pub fn hash(&self) -> Hash256 {
        let mut unsigned = Vec::new();
        self.encode_unsigned(&mut unsigned);
        sha256d(&unsigned)
    }

    /// Serialized size in bytes, programs included.
    pub fn size(&self) -> usize {
        self.to_bytes().len()
    }

    pub fn outpoints(&self) -> impl Iterator<Item = &OutPoint> + '_ {
        self.inputs.iter().map(|input| &input.previous)
    }

    /// Per-asset totals, given the outputs this transaction spends (in input
    /// order). Returns `None` on overflow.
    pub fn asset_flows(&self, spent: &[TxOutput]) -> Option<BTreeMap<Hash256, AssetFlow>> {
        let mut flows: BTreeMap<Hash256, AssetFlow> = BTreeMap::new();
        for prev in spent {
            let flow = flows.entry(prev.asset_id).or_default();
            flow.input = flow.input.checked_add(prev.value)?;
        }
        for output in &self.outputs {
            let flow = flows.entry(output.asset_id).or_default();
            flow.output = flow.output.checked_add(output.value)?;
        }
        Some(flows)
    }

    /// Amounts newly created by an issue-asset transaction, per asset.
    pub fn issued_amounts(&self, spent: &[TxOutput]) -> Vec<(Hash256, Fixed64)> {
        if !matches!(self.payload, Payload::IssueAsset) {
            return Vec::new();
        }
        self.asset_flows(spent)
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, flow)| flow.output > flow.input)
            .map(|(asset, flow)| (asset, Fixed64(flow.output.0 - flow.input.0)))
            .collect()
    }
}

impl Encode for Transaction {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.encode_unsigned(buf);
        write_list(buf, &self.programs);
    }
}

impl Decode for Transaction {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let tx_type = TxType::try_from(read_u8(buf)?)?;
        let payload_version = read_u8(buf)?;
        let payload = Payload::decode(tx_type, buf)?;
        Ok(Self {
            payload_version,
            payload,
            attributes: read_list(buf)?,
            inputs: read_list(buf)?,
            outputs: read_list(buf)?,
            lock_time: read_u32(buf)?,
            programs: read_list(buf)?,
        })
    }
}
