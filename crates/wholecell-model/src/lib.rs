//! Knowledge-base data model consumed by the whole-cell engine.
//!
//! The raw [`KnowledgeBase`] is the serde-friendly input shape produced by an
//! external annotation adapter. [`CompiledModel`] resolves every string id to
//! a stable integer index exactly once and builds the sparse
//! [`StoichiometricMatrix`], so the per-tick loop never hashes strings.
//! Structural errors (unknown metabolite ids, duplicate ids) surface here,
//! before the first simulation tick.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Fallback half-saturation constant when a reaction lists a substrate
/// without a matching Km entry.
pub const DEFAULT_KM: f64 = 0.1;

/// Tolerance for the mass-balance diagnostic.
const BALANCE_TOLERANCE: f64 = 1e-6;

/// Errors raised while compiling a knowledge base.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("duplicate gene id: {0}")]
    DuplicateGene(String),
    #[error("duplicate metabolite id: {0}")]
    DuplicateMetabolite(String),
    #[error("duplicate reaction id: {0}")]
    DuplicateReaction(String),
    #[error("reaction {reaction} references unknown metabolite {metabolite}")]
    UnknownMetabolite { reaction: String, metabolite: String },
    #[error("gene {gene} lists unknown regulator {regulator}")]
    UnknownRegulator { gene: String, regulator: String },
    #[error("knowledge base defines no {0}")]
    Empty(&'static str),
}

/// Chromosome strand of a gene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strand {
    #[default]
    Forward,
    Reverse,
}

/// A single annotated gene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gene {
    pub id: String,
    pub locus_tag: String,
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub end: u64,
    #[serde(default)]
    pub strand: Strand,
    #[serde(default)]
    pub essential: bool,
    /// Functional tags ("metabolism", "gene_expression", "transport", ...)
    /// used by regulation, transport, and the epigenetics module.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Gene ids of transcription factors acting on this gene's promoter.
    #[serde(default)]
    pub regulators: Vec<String>,
}

impl Gene {
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A metabolite species with its starting concentration (mM).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metabolite {
    pub id: String,
    #[serde(default)]
    pub compartment: String,
    #[serde(default)]
    pub initial_concentration: f64,
}

/// Optional kinetics annotation on a reaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kinetics {
    /// Turnover number (1/s).
    pub kcat: f64,
    /// Per-substrate half-saturation constants, keyed by metabolite id.
    #[serde(default)]
    pub km: HashMap<String, f64>,
    /// Per-inhibitor constants, keyed by metabolite id.
    #[serde(default)]
    pub ki: HashMap<String, f64>,
    /// Gibbs free energy change (J/mol), gates unfavorable irreversible flux.
    #[serde(default)]
    pub delta_g: Option<f64>,
    #[serde(default)]
    pub reversible: bool,
    #[serde(default = "default_lower_bound")]
    pub lower_bound: f64,
    #[serde(default = "default_upper_bound")]
    pub upper_bound: f64,
}

fn default_lower_bound() -> f64 {
    0.0
}

fn default_upper_bound() -> f64 {
    1_000.0
}

/// A metabolic reaction with positive coefficients on both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    /// Consumed metabolites, id -> coefficient.
    #[serde(default)]
    pub reactants: HashMap<String, f64>,
    /// Produced metabolites, id -> coefficient.
    #[serde(default)]
    pub products: HashMap<String, f64>,
    /// Boolean gene rule ("g1 and g2", "g1 or g3"); tokens that match gene
    /// ids identify the catalyzing gene products.
    #[serde(default)]
    pub gene_reaction_rule: String,
    #[serde(default)]
    pub kinetics: Option<Kinetics>,
}

impl Reaction {
    /// Gene-id tokens of the gene-reaction rule, with boolean operators and
    /// parentheses stripped.
    pub fn rule_tokens(&self) -> impl Iterator<Item = &str> {
        self.gene_reaction_rule
            .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
            .filter(|token| !token.is_empty() && *token != "and" && *token != "or")
    }

    fn participant_count(&self) -> usize {
        self.reactants.len() + self.products.len()
    }
}

/// The structured input model: genes, metabolites, and reactions.
///
/// Immutable once loaded; owned exclusively by the orchestrator for the
/// duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub organism: String,
    /// Genome length in base pairs.
    pub genome_length: u64,
    #[serde(default)]
    pub gc_content: f64,
    pub genes: Vec<Gene>,
    pub metabolites: Vec<Metabolite>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl KnowledgeBase {
    /// Resolve ids and build the sparse stoichiometry, reporting structural
    /// errors before the first tick.
    pub fn compile(self) -> Result<CompiledModel, ModelError> {
        CompiledModel::new(self)
    }
}

/// Sparse metabolite x reaction matrix in compressed-sparse-column form.
///
/// `S[i, j]` negative means metabolite `i` is consumed by reaction `j`,
/// positive means produced; magnitudes are stoichiometric coefficients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoichiometricMatrix {
    num_metabolites: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    coeff: Vec<f64>,
}

impl StoichiometricMatrix {
    #[must_use]
    pub fn num_metabolites(&self) -> usize {
        self.num_metabolites
    }

    #[must_use]
    pub fn num_reactions(&self) -> usize {
        self.col_ptr.len().saturating_sub(1)
    }

    /// Iterate the non-zero entries of reaction column `j` as
    /// `(metabolite_index, signed_coefficient)` pairs.
    pub fn reaction_entries(&self, j: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let start = self.col_ptr[j];
        let end = self.col_ptr[j + 1];
        self.row_idx[start..end]
            .iter()
            .copied()
            .zip(self.coeff[start..end].iter().copied())
    }

    /// Accumulate `delta += S * fluxes * dt` (sparse matrix-vector multiply).
    pub fn accumulate(&self, fluxes: &[f64], dt: f64, delta: &mut [f64]) {
        debug_assert_eq!(delta.len(), self.num_metabolites);
        for (j, &flux) in fluxes.iter().enumerate().take(self.num_reactions()) {
            if flux == 0.0 || !flux.is_finite() {
                continue;
            }
            for (i, coeff) in self.reaction_entries(j) {
                delta[i] += coeff * flux * dt;
            }
        }
    }

    /// Signed coefficient sum of one reaction column.
    #[must_use]
    pub fn column_sum(&self, j: usize) -> f64 {
        self.reaction_entries(j).map(|(_, c)| c).sum()
    }
}

/// One row of the on-demand mass-balance diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionBalance {
    pub reaction_id: String,
    pub balanced: bool,
    /// Signed coefficient sum (products minus reactants).
    pub net: f64,
}

/// A reaction with all ids resolved to dense indices.
#[derive(Debug, Clone)]
pub struct CompiledReaction {
    pub id: String,
    /// Turnover number; zero when the reaction carries no kinetics.
    pub kcat: f64,
    /// `(metabolite_index, km)` per substrate.
    pub substrates: Vec<(usize, f64)>,
    /// `(metabolite_index, ki)` per annotated inhibitor.
    pub inhibitors: Vec<(usize, f64)>,
    /// Gene indices of the catalyzing gene products.
    pub enzymes: Vec<usize>,
    pub delta_g: Option<f64>,
    pub reversible: bool,
    pub lower_bound: f64,
    pub upper_bound: f64,
    /// False when the knowledge base supplied no kinetics; such reactions
    /// contribute zero flux rather than raising.
    pub has_kinetics: bool,
}

/// The knowledge base with stable integer indices and precomputed sparse
/// stoichiometry. Built once; read-only during stepping.
#[derive(Debug, Clone)]
pub struct CompiledModel {
    kb: KnowledgeBase,
    gene_lookup: HashMap<String, usize>,
    metabolite_lookup: HashMap<String, usize>,
    /// Per-gene regulator indices resolved from [`Gene::regulators`].
    regulators: Vec<Vec<usize>>,
    reactions: Vec<CompiledReaction>,
    stoichiometry: StoichiometricMatrix,
}

impl CompiledModel {
    fn new(kb: KnowledgeBase) -> Result<Self, ModelError> {
        if kb.genes.is_empty() {
            return Err(ModelError::Empty("genes"));
        }
        if kb.metabolites.is_empty() {
            return Err(ModelError::Empty("metabolites"));
        }

        let mut gene_lookup = HashMap::with_capacity(kb.genes.len());
        for (idx, gene) in kb.genes.iter().enumerate() {
            if gene_lookup.insert(gene.id.clone(), idx).is_some() {
                return Err(ModelError::DuplicateGene(gene.id.clone()));
            }
        }
        let mut metabolite_lookup = HashMap::with_capacity(kb.metabolites.len());
        for (idx, metabolite) in kb.metabolites.iter().enumerate() {
            if metabolite_lookup
                .insert(metabolite.id.clone(), idx)
                .is_some()
            {
                return Err(ModelError::DuplicateMetabolite(metabolite.id.clone()));
            }
        }

        let mut regulators = Vec::with_capacity(kb.genes.len());
        for gene in &kb.genes {
            let mut resolved = Vec::with_capacity(gene.regulators.len());
            for regulator in &gene.regulators {
                let idx = gene_lookup.get(regulator).copied().ok_or_else(|| {
                    ModelError::UnknownRegulator {
                        gene: gene.id.clone(),
                        regulator: regulator.clone(),
                    }
                })?;
                resolved.push(idx);
            }
            regulators.push(resolved);
        }

        let mut seen_reactions = HashMap::with_capacity(kb.reactions.len());
        let mut reactions = Vec::with_capacity(kb.reactions.len());
        let mut col_ptr = Vec::with_capacity(kb.reactions.len() + 1);
        let mut row_idx = Vec::new();
        let mut coeff = Vec::new();
        col_ptr.push(0);

        for (j, reaction) in kb.reactions.iter().enumerate() {
            if seen_reactions.insert(reaction.id.clone(), j).is_some() {
                return Err(ModelError::DuplicateReaction(reaction.id.clone()));
            }

            let resolve = |id: &str| -> Result<usize, ModelError> {
                metabolite_lookup.get(id).copied().ok_or_else(|| {
                    ModelError::UnknownMetabolite {
                        reaction: reaction.id.clone(),
                        metabolite: id.to_string(),
                    }
                })
            };

            // Reactants enter the column negatively, products positively.
            let mut column: Vec<(usize, f64)> = Vec::with_capacity(reaction.participant_count());
            for (id, &c) in &reaction.reactants {
                column.push((resolve(id)?, -c));
            }
            for (id, &c) in &reaction.products {
                column.push((resolve(id)?, c));
            }
            column.sort_by_key(|&(i, _)| i);
            for (i, c) in column {
                row_idx.push(i);
                coeff.push(c);
            }
            col_ptr.push(row_idx.len());

            let kinetics = reaction.kinetics.as_ref();
            let substrates = reaction
                .reactants
                .keys()
                .map(|id| {
                    let km = kinetics
                        .and_then(|k| k.km.get(id).copied())
                        .unwrap_or(DEFAULT_KM);
                    Ok((resolve(id)?, km))
                })
                .collect::<Result<Vec<_>, ModelError>>()?;
            let inhibitors = kinetics
                .map(|k| {
                    k.ki.iter()
                        .map(|(id, &ki)| Ok((resolve(id)?, ki)))
                        .collect::<Result<Vec<_>, ModelError>>()
                })
                .transpose()?
                .unwrap_or_default();
            // Rule tokens that match no gene id are tolerated: annotation
            // pipelines routinely emit genes outside the modeled set.
            let enzymes = reaction
                .rule_tokens()
                .filter_map(|token| gene_lookup.get(token).copied())
                .collect();

            reactions.push(CompiledReaction {
                id: reaction.id.clone(),
                kcat: kinetics.map_or(0.0, |k| k.kcat),
                substrates,
                inhibitors,
                enzymes,
                delta_g: kinetics.and_then(|k| k.delta_g),
                reversible: kinetics.is_some_and(|k| k.reversible),
                lower_bound: kinetics.map_or(0.0, |k| k.lower_bound),
                upper_bound: kinetics.map_or(default_upper_bound(), |k| k.upper_bound),
                has_kinetics: kinetics.is_some(),
            });
        }

        let stoichiometry = StoichiometricMatrix {
            num_metabolites: kb.metabolites.len(),
            col_ptr,
            row_idx,
            coeff,
        };

        Ok(Self {
            kb,
            gene_lookup,
            metabolite_lookup,
            regulators,
            reactions,
            stoichiometry,
        })
    }

    #[must_use]
    pub fn kb(&self) -> &KnowledgeBase {
        &self.kb
    }

    #[must_use]
    pub fn num_genes(&self) -> usize {
        self.kb.genes.len()
    }

    #[must_use]
    pub fn num_metabolites(&self) -> usize {
        self.kb.metabolites.len()
    }

    #[must_use]
    pub fn num_reactions(&self) -> usize {
        self.reactions.len()
    }

    #[must_use]
    pub fn genes(&self) -> &[Gene] {
        &self.kb.genes
    }

    #[must_use]
    pub fn metabolites(&self) -> &[Metabolite] {
        &self.kb.metabolites
    }

    #[must_use]
    pub fn reactions(&self) -> &[CompiledReaction] {
        &self.reactions
    }

    #[must_use]
    pub fn stoichiometry(&self) -> &StoichiometricMatrix {
        &self.stoichiometry
    }

    /// Dense index of a gene id.
    #[must_use]
    pub fn gene_index(&self, id: &str) -> Option<usize> {
        self.gene_lookup.get(id).copied()
    }

    /// Dense index of a metabolite id.
    #[must_use]
    pub fn metabolite_index(&self, id: &str) -> Option<usize> {
        self.metabolite_lookup.get(id).copied()
    }

    /// Resolved regulator indices for gene `idx`.
    #[must_use]
    pub fn gene_regulators(&self, idx: usize) -> &[usize] {
        &self.regulators[idx]
    }

    /// Indices of genes carrying `tag`.
    pub fn genes_with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.kb
            .genes
            .iter()
            .enumerate()
            .filter(move |(_, gene)| gene.has_tag(tag))
            .map(|(idx, _)| idx)
    }

    /// Starting concentration vector in metabolite-index order.
    #[must_use]
    pub fn initial_concentrations(&self) -> Vec<f64> {
        self.kb
            .metabolites
            .iter()
            .map(|m| m.initial_concentration.max(0.0))
            .collect()
    }

    /// Read-only mass-balance diagnostic, run on demand (never during
    /// stepping). A reaction is balanced when its signed coefficient sum is
    /// within tolerance of zero, or when it has at most two participants
    /// (the transport exemption).
    #[must_use]
    pub fn mass_balance(&self) -> Vec<ReactionBalance> {
        self.kb
            .reactions
            .iter()
            .enumerate()
            .map(|(j, reaction)| {
                let net = self.stoichiometry.column_sum(j);
                ReactionBalance {
                    reaction_id: reaction.id.clone(),
                    balanced: net.abs() < BALANCE_TOLERANCE
                        || reaction.participant_count() <= 2,
                    net,
                }
            })
            .collect()
    }
}
