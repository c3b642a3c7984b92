//! Transaction serialization and signing
//!
//! Canonical binary encoding for the two transaction types the follower
//! submits: `TrustSet` and the optional partial-payment `Payment`. Fields are
//! emitted sorted by (type code, field code); issued amounts use the ledger's
//! sign/exponent/mantissa encoding and native amounts are integer drops.

use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::wallet::{decode_classic_address, sha512_half, Wallet};

// Serialized field type codes
const TYPE_UINT16: u8 = 1;
const TYPE_UINT32: u8 = 2;
const TYPE_AMOUNT: u8 = 6;
const TYPE_BLOB: u8 = 7;
const TYPE_ACCOUNT: u8 = 8;

// Field codes within their type
const FIELD_TRANSACTION_TYPE: u8 = 2;
const FIELD_FLAGS: u8 = 2;
const FIELD_SEQUENCE: u8 = 4;
const FIELD_AMOUNT: u8 = 1;
const FIELD_LIMIT_AMOUNT: u8 = 3;
const FIELD_FEE: u8 = 8;
const FIELD_SEND_MAX: u8 = 9;
const FIELD_DELIVER_MIN: u8 = 10;
const FIELD_SIGNING_PUB_KEY: u8 = 3;
const FIELD_TXN_SIGNATURE: u8 = 4;
const FIELD_ACCOUNT: u8 = 1;
const FIELD_DESTINATION: u8 = 3;

// Transaction type codes
const TT_PAYMENT: u16 = 0;
const TT_TRUST_SET: u16 = 20;

/// tfPartialPayment: deliver up to Amount, never less than DeliverMin
pub const TF_PARTIAL_PAYMENT: u32 = 0x0002_0000;

/// Hash prefix for the single-signature signing payload ("STX\0")
const HASH_PREFIX_SIGN: [u8; 4] = [0x53, 0x54, 0x58, 0x00];
/// Hash prefix for the transaction id ("TXN\0")
const HASH_PREFIX_TXN_ID: [u8; 4] = [0x54, 0x58, 0x4E, 0x00];

/// An issued-currency amount `{ currency, issuer, value }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedAmount {
    pub currency: String,
    pub issuer: String,
    pub value: Decimal,
}

/// A TrustSet transaction ready for signing
#[derive(Debug, Clone)]
pub struct TrustSetTx {
    pub sequence: u32,
    pub fee_drops: u64,
    pub limit_amount: IssuedAmount,
}

/// A partial-payment self-Payment used for the optional initial purchase
#[derive(Debug, Clone)]
pub struct PaymentTx {
    pub sequence: u32,
    pub fee_drops: u64,
    pub destination: String,
    pub amount: IssuedAmount,
    pub send_max_drops: u64,
    pub deliver_min: IssuedAmount,
}

/// A signed transaction blob plus its ledger hash
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub tx_blob: String,
    pub hash: String,
}

impl TrustSetTx {
    pub fn sign(&self, wallet: &Wallet) -> Result<SignedTransaction> {
        let fields = |signature: Option<&[u8]>| -> Result<TxSerializer> {
            let mut ser = TxSerializer::new();
            ser.push_u16(FIELD_TRANSACTION_TYPE, TT_TRUST_SET);
            ser.push_u32(FIELD_SEQUENCE, self.sequence);
            ser.push_issued_amount(FIELD_LIMIT_AMOUNT, &self.limit_amount)?;
            ser.push_drops(FIELD_FEE, self.fee_drops);
            ser.push_blob(FIELD_SIGNING_PUB_KEY, wallet.public_key());
            if let Some(sig) = signature {
                ser.push_blob(FIELD_TXN_SIGNATURE, sig);
            }
            ser.push_account(FIELD_ACCOUNT, wallet.account_id());
            Ok(ser)
        };
        sign_with(wallet, fields)
    }
}

impl PaymentTx {
    pub fn sign(&self, wallet: &Wallet) -> Result<SignedTransaction> {
        let destination = decode_classic_address(&self.destination)?;
        let fields = |signature: Option<&[u8]>| -> Result<TxSerializer> {
            let mut ser = TxSerializer::new();
            ser.push_u16(FIELD_TRANSACTION_TYPE, TT_PAYMENT);
            ser.push_u32(FIELD_FLAGS, TF_PARTIAL_PAYMENT);
            ser.push_u32(FIELD_SEQUENCE, self.sequence);
            ser.push_issued_amount(FIELD_AMOUNT, &self.amount)?;
            ser.push_drops(FIELD_FEE, self.fee_drops);
            ser.push_drops(FIELD_SEND_MAX, self.send_max_drops);
            ser.push_issued_amount(FIELD_DELIVER_MIN, &self.deliver_min)?;
            ser.push_blob(FIELD_SIGNING_PUB_KEY, wallet.public_key());
            if let Some(sig) = signature {
                ser.push_blob(FIELD_TXN_SIGNATURE, sig);
            }
            ser.push_account(FIELD_ACCOUNT, wallet.account_id());
            ser.push_account(FIELD_DESTINATION, &destination);
            Ok(ser)
        };
        sign_with(wallet, fields)
    }
}

fn sign_with<F>(wallet: &Wallet, build: F) -> Result<SignedTransaction>
where
    F: Fn(Option<&[u8]>) -> Result<TxSerializer>,
{
    let unsigned = build(None)?.serialize();

    let mut payload = Vec::with_capacity(4 + unsigned.len());
    payload.extend_from_slice(&HASH_PREFIX_SIGN);
    payload.extend_from_slice(&unsigned);
    let signature = wallet.sign(&payload);

    let signed = build(Some(&signature))?.serialize();

    let mut id_payload = Vec::with_capacity(4 + signed.len());
    id_payload.extend_from_slice(&HASH_PREFIX_TXN_ID);
    id_payload.extend_from_slice(&signed);
    let hash = sha512_half(&id_payload);

    Ok(SignedTransaction {
        tx_blob: hex_upper(&signed),
        hash: hex_upper(&hash),
    })
}

/// Collects serialized fields and emits them in canonical order
struct TxSerializer {
    fields: Vec<(u8, u8, Vec<u8>)>,
}

impl TxSerializer {
    fn new() -> Self {
        Self { fields: Vec::new() }
    }

    fn push_u16(&mut self, field: u8, value: u16) {
        self.fields.push((TYPE_UINT16, field, value.to_be_bytes().to_vec()));
    }

    fn push_u32(&mut self, field: u8, value: u32) {
        self.fields.push((TYPE_UINT32, field, value.to_be_bytes().to_vec()));
    }

    fn push_drops(&mut self, field: u8, drops: u64) {
        self.fields.push((TYPE_AMOUNT, field, encode_drops(drops).to_vec()));
    }

    fn push_issued_amount(&mut self, field: u8, amount: &IssuedAmount) -> Result<()> {
        self.fields.push((TYPE_AMOUNT, field, encode_issued_amount(amount)?));
        Ok(())
    }

    fn push_blob(&mut self, field: u8, data: &[u8]) {
        let mut bytes = encode_vl_length(data.len());
        bytes.extend_from_slice(data);
        self.fields.push((TYPE_BLOB, field, bytes));
    }

    fn push_account(&mut self, field: u8, account_id: &[u8; 20]) {
        let mut bytes = encode_vl_length(20);
        bytes.extend_from_slice(account_id);
        self.fields.push((TYPE_ACCOUNT, field, bytes));
    }

    fn serialize(mut self) -> Vec<u8> {
        self.fields.sort_by_key(|(type_code, field, _)| (*type_code, *field));
        let mut out = Vec::new();
        for (type_code, field, bytes) in self.fields {
            // Both codes stay below 16 for the fields we emit
            out.push((type_code << 4) | field);
            out.extend_from_slice(&bytes);
        }
        out
    }
}

/// Native amount: bit 62 set (positive), value in drops
fn encode_drops(drops: u64) -> [u8; 8] {
    (0x4000_0000_0000_0000u64 | drops).to_be_bytes()
}

/// Issued amount: 8-byte value, 20-byte currency, 20-byte issuer account id
fn encode_issued_amount(amount: &IssuedAmount) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(48);
    out.extend_from_slice(&encode_issued_value(amount.value)?);
    out.extend_from_slice(&encode_currency(&amount.currency)?);
    out.extend_from_slice(&decode_classic_address(&amount.issuer)?);
    Ok(out)
}

/// Sign/exponent/mantissa encoding of a decimal token value
fn encode_issued_value(value: Decimal) -> Result<[u8; 8]> {
    if value.is_zero() {
        return Ok(0x8000_0000_0000_0000u64.to_be_bytes());
    }
    if value.is_sign_negative() {
        return Err(Error::Signing("negative amounts are not submitted".to_string()));
    }

    const MANTISSA_MIN: u128 = 1_000_000_000_000_000; // 10^15
    const MANTISSA_MAX: u128 = 10_000_000_000_000_000; // 10^16

    let mut mantissa = value.mantissa().unsigned_abs();
    let mut exponent = -(value.scale() as i32);

    while mantissa < MANTISSA_MIN {
        mantissa *= 10;
        exponent -= 1;
    }
    while mantissa >= MANTISSA_MAX {
        mantissa /= 10;
        exponent += 1;
    }

    if !(-96..=80).contains(&exponent) {
        return Err(Error::Signing(format!("amount out of range: {}", value)));
    }

    let bits = (1u64 << 63)
        | (1u64 << 62)
        | (((exponent + 97) as u64) << 54)
        | mantissa as u64;
    Ok(bits.to_be_bytes())
}

/// 160-bit currency code: standard three-character codes occupy bytes 12-14
fn encode_currency(currency: &str) -> Result<[u8; 20]> {
    let mut out = [0u8; 20];
    if currency.len() == 3 && currency != "XRP" && currency.is_ascii() {
        out[12..15].copy_from_slice(currency.as_bytes());
        return Ok(out);
    }
    if currency.len() == 40 {
        for (i, chunk) in currency.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| Error::Signing(format!("invalid currency code: {}", currency)))?;
            out[i] = hex;
        }
        return Ok(out);
    }
    Err(Error::Signing(format!("invalid currency code: {}", currency)))
}

/// Variable-length prefix. All blobs we emit fit the single-byte form.
fn encode_vl_length(len: usize) -> Vec<u8> {
    debug_assert!(len <= 192);
    vec![len as u8]
}

fn hex_upper(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push_str(&format!("{:02X}", byte));
    }
    out
}
