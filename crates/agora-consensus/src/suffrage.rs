//! Suffrage: the validator set and proposer selection
//!
//! Every honest node must pick the same proposer for the same
//! `(height, round)`; implementations are deterministic functions of the
//! point and the member list.

use std::fmt;

use agora_core::{Address, AgoraError, Height, Result, Round};

/// Nodes eligible at a point, with the designated proposer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActingSuffrage {
    pub height: Height,
    pub round: Round,
    pub proposer: Address,
    pub nodes: Vec<Address>,
}

impl ActingSuffrage {
    pub fn exists(&self, address: &Address) -> bool {
        self.nodes.contains(address)
    }
}

pub trait Suffrage: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn is_inside(&self, address: &Address) -> bool;

    /// Members in a stable order
    fn nodes(&self) -> &[Address];

    fn acting(&self, height: Height, round: Round) -> ActingSuffrage;

    fn number_of_acting(&self) -> usize;

    fn is_acting(&self, height: Height, round: Round, address: &Address) -> bool {
        self.acting(height, round).exists(address)
    }

    fn is_proposer(&self, height: Height, round: Round, address: &Address) -> bool {
        self.acting(height, round).proposer == *address
    }
}

fn sorted_unique(mut nodes: Vec<Address>) -> Vec<Address> {
    nodes.sort();
    nodes.dedup();
    nodes
}

/// Same proposer at every point; all members act
#[derive(Clone, Debug)]
pub struct FixedSuffrage {
    proposer: Address,
    nodes: Vec<Address>,
}

impl FixedSuffrage {
    pub fn new(proposer: Address, nodes: Vec<Address>) -> Self {
        let mut nodes = sorted_unique(nodes);
        if !nodes.contains(&proposer) {
            nodes.push(proposer.clone());
            nodes.sort();
        }
        Self { proposer, nodes }
    }
}

impl Suffrage for FixedSuffrage {
    fn name(&self) -> &str {
        "fixed-suffrage"
    }

    fn is_inside(&self, address: &Address) -> bool {
        self.nodes.contains(address)
    }

    fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    fn acting(&self, height: Height, round: Round) -> ActingSuffrage {
        ActingSuffrage {
            height,
            round,
            proposer: self.proposer.clone(),
            nodes: self.nodes.clone(),
        }
    }

    fn number_of_acting(&self) -> usize {
        self.nodes.len()
    }
}

/// Proposer rotates over the sorted members by `height + round`; the
/// acting set is the proposer and the members following it
#[derive(Clone, Debug)]
pub struct RoundrobinSuffrage {
    nodes: Vec<Address>,
    number_of_acting: usize,
}

impl RoundrobinSuffrage {
    pub fn new(nodes: Vec<Address>, number_of_acting: usize) -> Result<Self> {
        let nodes = sorted_unique(nodes);
        if nodes.is_empty() {
            return Err(AgoraError::invalid("empty suffrage nodes"));
        }
        let number_of_acting = number_of_acting.clamp(1, nodes.len());
        Ok(Self {
            nodes,
            number_of_acting,
        })
    }

    fn proposer_index(&self, height: Height, round: Round) -> usize {
        let n = self.nodes.len() as u64;
        let h = height.value().max(0) as u64;
        ((h.wrapping_add(round.value())) % n) as usize
    }
}

impl Suffrage for RoundrobinSuffrage {
    fn name(&self) -> &str {
        "roundrobin-suffrage"
    }

    fn is_inside(&self, address: &Address) -> bool {
        self.nodes.contains(address)
    }

    fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    fn acting(&self, height: Height, round: Round) -> ActingSuffrage {
        let start = self.proposer_index(height, round);
        let nodes: Vec<Address> = (0..self.number_of_acting)
            .map(|i| self.nodes[(start + i) % self.nodes.len()].clone())
            .collect();

        ActingSuffrage {
            height,
            round,
            proposer: nodes[0].clone(),
            nodes,
        }
    }

    fn number_of_acting(&self) -> usize {
        self.number_of_acting
    }
}
