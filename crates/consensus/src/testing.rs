//! Test utilities: deterministic validator sets, genesis construction and a
//! minimal forging path.
//!
//! Forging proper is an external collaborator; the helpers here produce
//! exactly the blocks a well-behaved forger would, so tests can drive the
//! pipeline end to end.

use meridian_bft::BftModule;
use meridian_chain::{state_key, Chain, StateStore};
use meridian_engine::{EngineError, EngineEvent, ModuleHandler, StateMachine};
use meridian_types::{
    AggregateCommit, Address, BftParameters, Block, BlockHeader, BlsSecretKey, ChainId,
    GeneratorKeys, Signature, Slots, Transaction, Validator, CURRENT_BLOCK_VERSION, EMPTY_HASH,
};
use std::sync::Arc;

/// One validator's key material.
pub struct TestValidator {
    pub generator: GeneratorKeys,
    pub bls: BlsSecretKey,
}

impl TestValidator {
    pub fn address(&self) -> Address {
        self.generator.address()
    }
}

/// A deterministic validator universe for tests.
pub struct TestNet {
    pub validators: Vec<TestValidator>,
    pub params: BftParameters,
    pub chain_id: ChainId,
    pub slots: Slots,
}

impl TestNet {
    /// `count` validators of weight 1, threshold ⌊2n/3⌋+1, with a genesis
    /// timestamp far enough in the past that thousands of slots have
    /// already elapsed.
    pub fn new(count: u8) -> Self {
        let validators: Vec<TestValidator> = (0..count)
            .map(|i| TestValidator {
                generator: GeneratorKeys::from_seed(&[i + 1; 32]),
                bls: BlsSecretKey::from_seed(&[i + 101; 32]).unwrap(),
            })
            .collect();
        let params = BftParameters {
            certificate_threshold: u64::from(count) * 2 / 3 + 1,
            validators: validators
                .iter()
                .map(|v| Validator {
                    address: v.address(),
                    generator_key: v.generator.public_key(),
                    bls_public_key: v.bls.public_key(),
                    bft_weight: 1,
                })
                .collect(),
        };
        let block_time = Slots::DEFAULT_BLOCK_TIME;
        let now = crate::processor::BlockProcessor::now_secs();
        let slots = Slots::new(now - 100_000 * block_time, block_time);
        Self {
            validators,
            params,
            chain_id: ChainId([0, 0, 0, 1]),
            slots,
        }
    }

    pub fn validator_by_address(&self, address: &Address) -> &TestValidator {
        self.validators
            .iter()
            .find(|v| v.address() == *address)
            .expect("address belongs to the test net")
    }

    /// The genesis block matching this net's parameters.
    pub fn genesis(&self) -> Block {
        Block {
            header: BlockHeader {
                version: CURRENT_BLOCK_VERSION,
                timestamp: self.slots.genesis_timestamp(),
                height: 0,
                previous_block_id: meridian_types::Hash::ZERO,
                generator_address: Address::default(),
                transaction_root: EMPTY_HASH,
                state_root: EMPTY_HASH,
                validators_hash: self.params.validators_hash(),
                aggregate_commit: AggregateCommit::empty(0),
                max_height_generated: 0,
                max_height_prevoted: 0,
                signature: Signature::zero(),
            },
            assets: vec![],
            transactions: vec![],
        }
    }
}

/// Forge the block a well-behaved generator would produce `slot_offset`
/// slots after the tip (1 = the very next slot).
pub fn forge_next_block(
    net: &TestNet,
    chain: &Chain,
    machine: &StateMachine,
    bft: &BftModule,
    slot_offset: i64,
    transactions: Vec<Transaction>,
) -> Block {
    assert!(slot_offset >= 1, "blocks must advance the slot");
    let tip = chain.last_header();
    let slot = net.slots.slot_of(tip.timestamp) + slot_offset;
    let timestamp = net.slots.slot_start(slot);
    let generator = net
        .params
        .generator_for_slot(slot)
        .expect("non-empty validator set")
        .address;
    let keys = net.validator_by_address(&generator);
    let heights = bft.heights();

    // The generator's own highest previously-forged height.
    let max_height_generated = last_generated_height(chain, &generator, tip.height);

    let mut block = Block {
        header: BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            timestamp,
            height: tip.height + 1,
            previous_block_id: tip.id(),
            generator_address: generator,
            transaction_root: EMPTY_HASH,
            state_root: EMPTY_HASH,
            validators_hash: net.params.validators_hash(),
            aggregate_commit: AggregateCommit::empty(heights.max_height_certified),
            max_height_generated,
            max_height_prevoted: heights.max_height_prevoted,
            signature: Signature::zero(),
        },
        assets: vec![],
        transactions,
    };
    block.header.transaction_root = block.compute_transaction_root();

    // Dry-run execution against a scratch overlay for the state root.
    let mut store = StateStore::new(chain.storage());
    let outcome = machine
        .execute_block(&mut store, &block)
        .expect("forged payload must execute");
    block.header.state_root = outcome.state_root;

    block.header.sign(&keys.generator, &net.chain_id);
    block
}

fn last_generated_height(chain: &Chain, generator: &Address, tip_height: u32) -> u32 {
    let mut height = tip_height;
    while height > 0 {
        let Ok(Some(header)) = chain.get_header_by_height(height) else {
            break;
        };
        if header.generator_address == *generator {
            return header.height;
        }
        height -= 1;
    }
    0
}

/// A storage-backed key/value module so test blocks can carry transactions:
/// command "set" stores the params under the sender's key.
pub struct KvModule;

impl ModuleHandler for KvModule {
    fn verify_transaction(&self, tx: &Transaction) -> Result<(), EngineError> {
        if tx.command != "set" {
            return Err(EngineError::Rejected {
                module: "kv".to_string(),
                reason: format!("unknown command {}", tx.command),
            });
        }
        Ok(())
    }

    fn apply(
        &self,
        store: &mut StateStore<'_>,
        tx: &Transaction,
    ) -> Result<Vec<EngineEvent>, EngineError> {
        store.set(
            state_key("kv", tx.sender_address().as_bytes()),
            tx.params.clone(),
        );
        Ok(vec![])
    }
}

/// A state machine with the kv module registered.
pub fn test_machine(chain_id: ChainId) -> StateMachine {
    let mut machine = StateMachine::new(chain_id);
    machine.register("kv", Arc::new(KvModule));
    machine
}

/// A signed kv/set transaction.
pub fn kv_transaction(net: &TestNet, sender: &GeneratorKeys, nonce: u64, value: u8) -> Transaction {
    let mut tx = Transaction {
        module: "kv".to_string(),
        command: "set".to_string(),
        nonce,
        fee: 1,
        sender_public_key: sender.public_key(),
        params: vec![value],
        signature: Signature::zero(),
    };
    tx.signature = sender.sign(&tx.signing_bytes(&net.chain_id));
    tx
}
