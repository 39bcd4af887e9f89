//! Fixtures shared by unit tests

use chrono::Utc;
use std::collections::BTreeMap;

use agora_core::{find_majority, Address, Height, MajorityResult, NetworkId, Round, StagePoint, Threshold, ThresholdRatio};
use agora_crypto::{Hash, PrivateKey};

use crate::ballot::{Ballot, BallotFact};
use crate::local::LocalNode;
use crate::suffrage::FixedSuffrage;
use crate::voteproof::{Voteproof, VoteproofNodeFact};

pub const TEST_RATIO: f64 = 66.0;

pub fn network() -> NetworkId {
    NetworkId::new("test").unwrap()
}

pub fn genesis_hash() -> Hash {
    Hash::digest(b"genesis")
}

pub fn test_nodes(n: usize) -> Vec<LocalNode> {
    (0..n)
        .map(|i| {
            LocalNode::new(
                Address::new(&format!("n{}", i)).unwrap(),
                PrivateKey::from_seed(&[(i + 1) as u8; 32]),
            )
        })
        .collect()
}

pub fn fixed_suffrage(nodes: &[LocalNode]) -> FixedSuffrage {
    FixedSuffrage::new(
        nodes[0].address().clone(),
        nodes.iter().map(|n| n.address().clone()).collect(),
    )
}

pub fn sign_ballot(node: &LocalNode, fact: BallotFact, base: Option<Voteproof>, accept: Option<Voteproof>) -> Ballot {
    Ballot::new(fact, base, accept, node, &network(), Utc::now())
}

/// Voteproof from `voters`, each voting the fact `fact_of(voter)`
pub fn make_voteproof(nodes: &[LocalNode], voters: &[usize], fact_of: impl Fn(usize) -> BallotFact) -> Voteproof {
    let first = fact_of(voters[0]);
    let point = first.stage_point();

    let mut facts: BTreeMap<Hash, BallotFact> = BTreeMap::new();
    let mut votes = BTreeMap::new();
    for i in voters {
        let fact = fact_of(*i);
        let ballot = sign_ballot(&nodes[*i], fact.clone(), None, None);
        let sign = ballot.fact_sign().clone();
        votes.insert(
            sign.node.clone(),
            VoteproofNodeFact {
                address: sign.node,
                ballot: ballot.hash(),
                fact: fact.hash(),
                fact_signature: sign.signature,
                signer: sign.signer,
                signed_at: sign.signed_at,
            },
        );
        facts.insert(fact.hash(), fact);
    }

    let threshold = Threshold::new(nodes.len() as u64, ThresholdRatio::new(TEST_RATIO).unwrap()).unwrap();
    let counts: Vec<u64> = facts
        .keys()
        .map(|h| votes.values().filter(|v: &&VoteproofNodeFact| v.fact == *h).count() as u64)
        .collect();
    let outcome = find_majority(threshold.total, threshold.threshold, &counts);
    let majority = match outcome {
        MajorityResult::Majority(i) => facts.values().nth(i).cloned(),
        _ => None,
    };

    Voteproof::new(
        StagePoint::new(point.height(), point.round(), point.stage),
        nodes.iter().map(|n| n.address().clone()).collect(),
        threshold,
        outcome.result(),
        majority,
        facts.into_values().collect(),
        votes,
        Utc::now(),
    )
}

pub fn init_voteproof(nodes: &[LocalNode], height: Height, round: Round, voters: &[usize]) -> Voteproof {
    make_voteproof(nodes, voters, |_| BallotFact::init(height, round, genesis_hash()))
}

pub fn accept_voteproof(nodes: &[LocalNode], height: Height, round: Round, voters: &[usize]) -> Voteproof {
    make_voteproof(nodes, voters, |_| {
        BallotFact::accept(height, round, Hash::digest(b"proposal"), Hash::digest(b"new-block"))
    })
}

/// Every voter votes a different INIT fact
pub fn draw_init_voteproof(nodes: &[LocalNode], height: Height, round: Round) -> Voteproof {
    let voters: Vec<usize> = (0..nodes.len()).collect();
    make_voteproof(nodes, &voters, |i| {
        BallotFact::init(height, round, Hash::digest(format!("block-{}", i).as_bytes()))
    })
}
