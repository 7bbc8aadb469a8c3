use crate::error::{ModelError, Result};
use crate::library;
use crate::scope::Override;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

pub const STUDY_NAMES: &[&str] = &["cascade_haploid"];

/// Mixed-radix enumeration of genotypes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placevalue {
    n: Vec<usize>,
    len: usize,
    names: Vec<String>,
    msd_first: bool,
}

impl Placevalue {
    pub fn new(n: Vec<usize>) -> Result<Self> {
        if let Some(i) = n.iter().position(|&k| k == 0) {
            return Err(ModelError::ShapeMismatch {
                target: format!("alleles at locus {i}"),
                expected: 1,
                found: 0,
            });
        }
        let len = n
            .iter()
            .try_fold(1usize, |acc, &k| acc.checked_mul(k))
            .ok_or_else(|| {
                ModelError::InvalidStudy(format!(
                    "{} loci with {:?} alleles exceed the addressable genotype count",
                    n.len(),
                    n
                ))
            })?;
        let names = (0..n.len()).map(|i| format!("Locus{}", i + 1)).collect();
        Ok(Self {
            n,
            len,
            names,
            msd_first: false,
        })
    }

    pub fn with_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.n.len() {
            return Err(ModelError::ShapeMismatch {
                target: "locus names".to_string(),
                expected: self.n.len(),
                found: names.len(),
            });
        }
        self.names = names;
        Ok(self)
    }

    pub fn msd_first(mut self, yes: bool) -> Self {
        self.msd_first = yes;
        self
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn loci(&self) -> usize {
        self.n.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.n.len()).collect();
        if self.msd_first {
            order.reverse();
        }
        order
    }

    pub fn int2digits(&self, mut i: usize) -> Result<Vec<usize>> {
        if i >= self.len() {
            return Err(ModelError::ShapeMismatch {
                target: "genotype index".to_string(),
                expected: self.len(),
                found: i,
            });
        }
        let mut digits = vec![0; self.n.len()];
        for locus in self.order() {
            digits[locus] = i % self.n[locus];
            i /= self.n[locus];
        }
        Ok(digits)
    }

    pub fn digits2int(&self, digits: &[usize]) -> Result<usize> {
        if digits.len() != self.n.len() {
            return Err(ModelError::ShapeMismatch {
                target: "genotype".to_string(),
                expected: self.n.len(),
                found: digits.len(),
            });
        }
        let mut value = 0;
        for locus in self.order().into_iter().rev() {
            if digits[locus] >= self.n[locus] {
                return Err(ModelError::ShapeMismatch {
                    target: format!("allele at locus {locus}"),
                    expected: self.n[locus],
                    found: digits[locus],
                });
            }
            value = value * self.n[locus] + digits[locus];
        }
        Ok(value)
    }

    pub fn genotypes(&self) -> Vec<Vec<usize>> {
        (0..self.len())
            .filter_map(|i| self.int2digits(i).ok())
            .collect()
    }
}

/// Parameter vector for one haploid genotype.
///
/// `hetpar[j]` lists the value of parameter `j` for each allele. A parameter
/// linked to a locus by `loc2par[j]` takes the column selected by that
/// locus' allele; unlinked parameters take allele 0.
pub fn geno2par_haploid(
    genotype: &[usize],
    hetpar: &[Vec<f64>],
    loc2par: &[Option<usize>],
) -> Result<Vec<f64>> {
    if hetpar.len() != loc2par.len() {
        return Err(ModelError::ShapeMismatch {
            target: "loc2par".to_string(),
            expected: hetpar.len(),
            found: loc2par.len(),
        });
    }
    hetpar
        .iter()
        .zip(loc2par)
        .enumerate()
        .map(|(j, (alleles, locus))| {
            let allele = match locus {
                Some(l) => *genotype.get(*l).ok_or_else(|| ModelError::ShapeMismatch {
                    target: "genotype".to_string(),
                    expected: l + 1,
                    found: genotype.len(),
                })?,
                None => 0,
            };
            alleles
                .get(allele)
                .copied()
                .ok_or_else(|| ModelError::ShapeMismatch {
                    target: format!("alleles of parameter {j}"),
                    expected: allele + 1,
                    found: alleles.len(),
                })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table<T> {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<T>>,
}

impl<T> Table<T> {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudyTables {
    pub genotypes: Table<usize>,
    pub parameters: Table<f64>,
    pub phenotypes: Table<f64>,
}

pub fn replicate_seed(nloci: usize, job_id: usize) -> u64 {
    ((nloci as u64) << 32) ^ job_id as u64
}

const EQ_TMAX: f64 = 1000.0;
const EQ_TOL: f64 = 1e-6;

/// Haploid cascade study: one biallelic locus per gene.
pub fn cascade_haploid(nloci: usize, seed: u64) -> Result<StudyTables> {
    check_loci(nloci)?;
    let mut model = library::cascade(nloci)?;
    let layout = model.parameters().layout().clone();
    let defaults = model.parameters().to_vec();
    let mut rng = StdRng::seed_from_u64(seed);

    let hill = layout.index_of("hill");
    let mut hetpar = Vec::with_capacity(defaults.len());
    let mut loc2par = Vec::with_capacity(defaults.len());
    for (j, name) in layout.names().enumerate() {
        if Some(j) == hill {
            hetpar.push(vec![defaults[j]; 2]);
            loc2par.push(None);
            continue;
        }
        let value = defaults[j] * rng.random_range(0.5..1.5);
        let factor = if name.starts_with("alpha") { 2.0 } else { 1.0 };
        hetpar.push(vec![value, value * factor]);
        loc2par.push(Some(j / 3));
    }

    let names: Vec<String> = (1..=nloci).map(|i| format!("Gene{i}")).collect();
    let genotypes = Placevalue::new(vec![2; nloci])?.with_names(names)?;
    let mut tables = StudyTables {
        genotypes: Table::new(genotypes.names().to_vec()),
        parameters: Table::new(layout.names().map(String::from).collect()),
        phenotypes: Table::new(model.state().layout().names().map(String::from).collect()),
    };
    for gt in genotypes.genotypes() {
        let par = geno2par_haploid(&gt, &hetpar, &loc2par)?;
        let ov = Override::new().parameters(par.clone()).state(0.0);
        let (t, y) = model.with_override(ov, |m| m.equilibrium(EQ_TMAX, EQ_TOL))?;
        debug!(genotype = ?gt, t, "equilibrium");
        tables.genotypes.rows.push(gt);
        tables.parameters.rows.push(par);
        tables.phenotypes.rows.push(y);
    }
    Ok(tables)
}

pub fn check_loci(nloci: usize) -> Result<()> {
    if nloci == 0 {
        return Err(ModelError::InvalidStudy("Nloci must be at least 1".to_string()));
    }
    Ok(())
}

pub fn run_study(name: &str, nloci: usize, seed: u64) -> Result<StudyTables> {
    match name {
        "cascade_haploid" => cascade_haploid(nloci, seed),
        other => Err(ModelError::UnknownModel(format!(
            "{other} (known studies: {})",
            STUDY_NAMES.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placevalue_varies_first_locus_fastest() {
        let pv = Placevalue::new(vec![2, 3]).expect("placevalue");
        assert_eq!(pv.len(), 6);
        assert_eq!(
            pv.genotypes(),
            vec![
                vec![0, 0],
                vec![1, 0],
                vec![0, 1],
                vec![1, 1],
                vec![0, 2],
                vec![1, 2]
            ]
        );
        assert_eq!(pv.digits2int(&[1, 2]).expect("index"), 5);
    }

    #[test]
    fn placevalue_msd_first_varies_last_locus_fastest() {
        let pv = Placevalue::new(vec![2, 3]).expect("placevalue").msd_first(true);
        assert_eq!(pv.int2digits(1).expect("digits"), vec![0, 1]);
        assert_eq!(pv.int2digits(3).expect("digits"), vec![1, 0]);
        for i in 0..pv.len() {
            let digits = pv.int2digits(i).expect("digits");
            assert_eq!(pv.digits2int(&digits).expect("index"), i);
        }
    }

    #[test]
    fn placevalue_rejects_out_of_range() {
        let pv = Placevalue::new(vec![2, 2]).expect("placevalue");
        assert!(pv.int2digits(4).is_err());
        assert!(pv.digits2int(&[2, 0]).is_err());
        assert!(Placevalue::new(vec![2, 0]).is_err());
    }

    #[test]
    fn placevalue_rejects_unaddressable_genotype_count() {
        let err = Placevalue::new(vec![2; 64]).expect_err("2^64 genotypes");
        assert!(matches!(err, ModelError::InvalidStudy(_)));
        assert!(err.is_configuration_fault());
        let pv = Placevalue::new(vec![2; 10]).expect("placevalue");
        assert_eq!(pv.len(), 1024);
    }

    #[test]
    fn study_without_loci_is_rejected() {
        let err = cascade_haploid(0, 0).expect_err("no loci");
        assert!(matches!(err, ModelError::InvalidStudy(_)));
        assert!(cascade_haploid(64, 0).is_err());
    }

    #[test]
    fn haploid_map_picks_allele_column_per_locus() {
        let hetpar = vec![vec![1.0, 2.0], vec![10.0, 20.0], vec![7.0, 8.0]];
        let loc2par = vec![Some(0), Some(1), None];
        assert_eq!(
            geno2par_haploid(&[1, 0], &hetpar, &loc2par).expect("par"),
            vec![2.0, 10.0, 7.0]
        );
        assert_eq!(
            geno2par_haploid(&[0, 1], &hetpar, &loc2par).expect("par"),
            vec![1.0, 20.0, 7.0]
        );
        assert!(geno2par_haploid(&[0], &hetpar, &loc2par).is_err());
    }

    #[test]
    fn cascade_study_is_reproducible_and_restores_model() {
        let a = cascade_haploid(2, replicate_seed(2, 7)).expect("study");
        let b = cascade_haploid(2, replicate_seed(2, 7)).expect("study");
        assert_eq!(a, b);
        assert_eq!(a.genotypes.rows.len(), 4);
        assert_eq!(a.parameters.columns.len(), 7);
        assert_eq!(a.phenotypes.columns, vec!["Y1", "Y2"]);
        // gene 1 is constitutive, so its equilibrium is alpha1 / gamma1
        for (par, ph) in a.parameters.rows.iter().zip(&a.phenotypes.rows) {
            assert!((ph[0] - par[0] / par[2]).abs() < 1e-4);
        }
        // allele 1 doubles production at the first locus
        assert!(a.phenotypes.rows[1][0] > a.phenotypes.rows[0][0]);
    }

    #[test]
    fn different_replicates_sample_different_parameters() {
        let a = cascade_haploid(1, replicate_seed(1, 0)).expect("study");
        let b = cascade_haploid(1, replicate_seed(1, 1)).expect("study");
        assert_ne!(a.parameters, b.parameters);
    }

    #[test]
    fn unknown_study_name_fails() {
        assert!(matches!(
            run_study("adjmotifs", 2, 0),
            Err(ModelError::UnknownModel(_))
        ));
    }
}
