//! Builds unsigned legacy gateway transactions, computes the EIP-155
//! signing hash, and assembles the committee's raw signature into a
//! broadcastable transaction.

use ethers::abi::{self, Token};
use ethers::core::k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature, TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use tracing::debug;

use crate::chain_id::ChainId;

use super::{gateway_function, GatewayFunction, OutboundTxData, TxClass, TxError};

/// Applied when the authorization carries no gas limit.
const DEFAULT_GAS_LIMIT: u64 = 500_000;

pub struct TxBuilder {
    chain: ChainId,
    gateway: Address,
}

impl TxBuilder {
    #[must_use]
    pub const fn new(chain: ChainId, gateway: Address) -> Self {
        Self { chain, gateway }
    }

    /// Assemble the unsigned legacy (type-0) transaction for an outbound
    /// authorization. The recipient is always the gateway; value is only
    /// attached for native value-bearing classes.
    pub fn build_unsigned(
        &self,
        data: &OutboundTxData,
        nonce: U256,
        gas_price: U256,
    ) -> Result<TypedTransaction, TxError> {
        let amount = U256::from_dec_str(&data.amount)
            .map_err(|_| TxError::InvalidAmount(data.amount.clone()))?;
        let gas = parse_gas_limit(&data.gas_limit)?;
        let function = gateway_function(data.class, data.is_native())?;
        let calldata = encode_call(function, data, amount);

        let value = if data.is_native() && carries_value(data.class) {
            amount
        } else {
            U256::zero()
        };

        debug!(
            chain = %self.chain,
            function = function.signature(),
            %value,
            %gas,
            "Built outbound transaction"
        );

        let tx = TransactionRequest::new()
            .to(self.gateway)
            .nonce(nonce)
            .gas_price(gas_price)
            .gas(gas)
            .value(value)
            .data(Bytes::from(calldata))
            .chain_id(self.chain.eip155());

        Ok(TypedTransaction::Legacy(tx))
    }

    /// EIP-155 signing hash of the unsigned transaction.
    #[must_use]
    pub fn signing_hash(tx: &TypedTransaction) -> H256 {
        tx.sighash()
    }

    /// Search `v ∈ {0..3}` for the recovery id under which the raw
    /// `r||s` signature recovers `expected_signer`, apply the EIP-155
    /// transform, and RLP-encode the signed transaction.
    pub fn assemble_signature(
        &self,
        tx: &TypedTransaction,
        raw: &[u8],
        expected_signer: Address,
    ) -> Result<Bytes, TxError> {
        if raw.len() != 64 {
            return Err(TxError::InvalidSignature);
        }
        let ecdsa = EcdsaSignature::from_slice(raw).map_err(|_| TxError::InvalidSignature)?;
        let hash = tx.sighash();
        let r = U256::from_big_endian(&raw[..32]);
        let s = U256::from_big_endian(&raw[32..]);

        for v_rec in 0_u8..4 {
            let Some(recovery_id) = RecoveryId::from_byte(v_rec) else {
                continue;
            };
            let Ok(key) = VerifyingKey::recover_from_prehash(hash.as_bytes(), &ecdsa, recovery_id)
            else {
                continue;
            };
            if verifying_key_to_address(&key) != expected_signer {
                continue;
            }

            let v = self.chain.eip155() * 2 + 35 + u64::from(v_rec);
            let signature = Signature { r, s, v };
            return Ok(tx.rlp_signed(&signature));
        }

        Err(TxError::RecoveryIdNotFound)
    }
}

const fn carries_value(class: TxClass) -> bool {
    matches!(
        class,
        TxClass::Funds | TxClass::FundsAndPayload | TxClass::InboundRevert
    )
}

fn parse_gas_limit(raw: &str) -> Result<U256, TxError> {
    if raw.is_empty() || raw == "0" {
        return Ok(U256::from(DEFAULT_GAS_LIMIT));
    }
    U256::from_dec_str(raw).map_err(|_| TxError::InvalidGasLimit(raw.to_owned()))
}

/// Right-pad to a 32-byte word; longer inputs keep their 32-byte prefix.
fn pad_bytes32(raw: &[u8]) -> [u8; 32] {
    let mut out = [0_u8; 32];
    let len = raw.len().min(32);
    out[..len].copy_from_slice(&raw[..len]);
    out
}

fn encode_call(function: GatewayFunction, data: &OutboundTxData, amount: U256) -> Vec<u8> {
    let tx_id = Token::FixedBytes(pad_bytes32(&data.tx_id).to_vec());
    let universal_tx_id = Token::FixedBytes(pad_bytes32(&data.universal_tx_id).to_vec());
    let revert_tuple = Token::Tuple(vec![
        Token::Address(data.revert.recipient),
        Token::Bytes(data.revert.message.clone()),
    ]);

    let tokens = match function {
        GatewayFunction::Withdraw => vec![
            tx_id,
            universal_tx_id,
            Token::Address(data.sender),
            Token::Address(data.recipient),
            Token::Uint(amount),
        ],
        GatewayFunction::WithdrawTokens => vec![
            tx_id,
            universal_tx_id,
            Token::Address(data.sender),
            Token::Address(data.recipient),
            Token::Address(data.asset_addr),
            Token::Uint(amount),
        ],
        GatewayFunction::ExecuteUniversalTxNative => vec![
            tx_id,
            universal_tx_id,
            Token::Address(data.sender),
            Token::Address(data.recipient),
            Token::Uint(amount),
            Token::Bytes(data.payload.clone()),
        ],
        GatewayFunction::ExecuteUniversalTxToken => vec![
            tx_id,
            universal_tx_id,
            Token::Address(data.sender),
            Token::Address(data.recipient),
            Token::Address(data.asset_addr),
            Token::Uint(amount),
            Token::Bytes(data.payload.clone()),
        ],
        GatewayFunction::RevertUniversalTx => {
            vec![tx_id, universal_tx_id, Token::Uint(amount), revert_tuple]
        }
        GatewayFunction::RevertUniversalTxToken => vec![
            tx_id,
            universal_tx_id,
            Token::Address(data.asset_addr),
            Token::Uint(amount),
            revert_tuple,
        ],
    };

    let mut calldata = function.selector().to_vec();
    calldata.extend(abi::encode(&tokens));
    calldata
}

fn verifying_key_to_address(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

#[cfg(test)]
mod tests {
    use ethers::core::k256::ecdsa::SigningKey;
    use ethers::utils::rlp::Rlp;
    use ethers::utils::secret_key_to_address;
    use hex_literal::hex;

    use crate::outbound::RevertInstructions;

    use super::*;

    fn chain() -> ChainId {
        ChainId::new(11_155_111)
    }

    fn builder() -> TxBuilder {
        TxBuilder::new(chain(), Address::repeat_byte(0x42))
    }

    fn outbound(class: TxClass, asset: Address) -> OutboundTxData {
        OutboundTxData {
            tx_id: vec![0xaa; 32],
            universal_tx_id: vec![0xbb; 32],
            destination_chain: chain(),
            sender: Address::repeat_byte(0x01),
            recipient: Address::repeat_byte(0x02),
            asset_addr: asset,
            amount: "1000000000000000000".to_owned(),
            payload: vec![0xde, 0xad],
            revert: RevertInstructions {
                recipient: Address::repeat_byte(0x03),
                message: b"refund".to_vec(),
            },
            class,
            gas_limit: String::new(),
        }
    }

    fn unsigned(class: TxClass, asset: Address) -> TypedTransaction {
        builder()
            .build_unsigned(&outbound(class, asset), U256::from(7), U256::from(1_000_000_000))
            .unwrap()
    }

    #[test]
    fn calldata_starts_with_selector() {
        let tx = unsigned(TxClass::Funds, Address::zero());
        let data = tx.data().unwrap();
        assert_eq!(&data[..4], GatewayFunction::Withdraw.selector());
    }

    #[test]
    fn native_funds_and_payload_carries_value() {
        let tx = unsigned(TxClass::FundsAndPayload, Address::zero());
        assert_eq!(tx.value(), Some(&U256::exp10(18)));

        let tx = unsigned(TxClass::FundsAndPayload, Address::repeat_byte(0x09));
        assert_eq!(tx.value(), Some(&U256::zero()));
    }

    #[test]
    fn payload_class_never_carries_value() {
        let tx = unsigned(TxClass::Payload, Address::zero());
        assert_eq!(tx.value(), Some(&U256::zero()));
    }

    #[test]
    fn to_is_always_the_gateway() {
        for class in [TxClass::Funds, TxClass::Payload, TxClass::InboundRevert] {
            let tx = unsigned(class, Address::zero());
            assert_eq!(
                tx.to().unwrap().as_address().unwrap(),
                &Address::repeat_byte(0x42)
            );
        }
    }

    #[test]
    fn gas_limit_defaults_to_500k() {
        let mut data = outbound(TxClass::Funds, Address::zero());
        let build = |data: &OutboundTxData| {
            builder()
                .build_unsigned(data, U256::zero(), U256::one())
                .unwrap()
        };

        assert_eq!(build(&data).gas(), Some(&U256::from(500_000)));

        data.gas_limit = "0".to_owned();
        assert_eq!(build(&data).gas(), Some(&U256::from(500_000)));

        data.gas_limit = "250000".to_owned();
        assert_eq!(build(&data).gas(), Some(&U256::from(250_000)));

        data.gas_limit = "bogus".to_owned();
        assert!(matches!(
            builder().build_unsigned(&data, U256::zero(), U256::one()),
            Err(TxError::InvalidGasLimit(_))
        ));
    }

    #[test]
    fn bad_amount_is_rejected() {
        let mut data = outbound(TxClass::Funds, Address::zero());
        data.amount = "12.5".to_owned();
        assert!(matches!(
            builder().build_unsigned(&data, U256::zero(), U256::one()),
            Err(TxError::InvalidAmount(_))
        ));
    }

    #[test]
    fn short_tx_ids_are_right_padded() {
        let mut data = outbound(TxClass::Funds, Address::zero());
        data.tx_id = vec![0x11, 0x22];
        let tx = builder()
            .build_unsigned(&data, U256::zero(), U256::one())
            .unwrap();
        let calldata = tx.data().unwrap();
        // First argument word after the selector.
        assert_eq!(&calldata[4..6], &[0x11, 0x22][..]);
        assert!(calldata[6..36].iter().all(|&b| b == 0));
    }

    #[test]
    fn sighash_folds_in_chain_id() {
        let data = outbound(TxClass::Funds, Address::zero());
        let tx_a = builder()
            .build_unsigned(&data, U256::zero(), U256::one())
            .unwrap();
        let tx_b = TxBuilder::new(ChainId::new(1), Address::repeat_byte(0x42))
            .build_unsigned(&data, U256::zero(), U256::one())
            .unwrap();
        assert_ne!(TxBuilder::signing_hash(&tx_a), TxBuilder::signing_hash(&tx_b));
    }

    #[test]
    fn assembled_signature_recovers_signer() {
        let signing_key = SigningKey::from_slice(&hex!(
            "ee79b5f6e221356af78cf4c36f4f7885a11b67dfcc81c34d80249947330c0f82"
        ))
        .unwrap();
        let signer = secret_key_to_address(&signing_key);

        let tx = unsigned(TxClass::Funds, Address::zero());
        let hash = TxBuilder::signing_hash(&tx);

        let (signature, _) = signing_key
            .sign_prehash_recoverable(hash.as_bytes())
            .unwrap();
        let raw: [u8; 64] = signature.to_bytes().into();

        let encoded = builder().assemble_signature(&tx, &raw, signer).unwrap();

        let rlp = Rlp::new(&encoded);
        let (decoded, sig) = TypedTransaction::decode_signed(&rlp).unwrap();
        assert_eq!(decoded.sighash(), hash);
        assert_eq!(sig.recover(hash).unwrap(), signer);
        // EIP-155 v encodes the chain id.
        assert!(sig.v == chain().eip155() * 2 + 35 || sig.v == chain().eip155() * 2 + 36);
    }

    #[test]
    fn wrong_signer_yields_recovery_id_not_found() {
        let signing_key = SigningKey::from_slice(&[0x17; 32]).unwrap();
        let tx = unsigned(TxClass::Funds, Address::zero());
        let hash = TxBuilder::signing_hash(&tx);
        let (signature, _) = signing_key
            .sign_prehash_recoverable(hash.as_bytes())
            .unwrap();
        let raw: [u8; 64] = signature.to_bytes().into();

        let result = builder().assemble_signature(&tx, &raw, Address::repeat_byte(0x99));
        assert!(matches!(result, Err(TxError::RecoveryIdNotFound)));
    }

    #[test]
    fn malformed_signature_is_rejected() {
        let tx = unsigned(TxClass::Funds, Address::zero());
        let result = builder().assemble_signature(&tx, &[0_u8; 63], Address::zero());
        assert!(matches!(result, Err(TxError::InvalidSignature)));
    }
}
