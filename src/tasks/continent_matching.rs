//! "Are X and Y on the same continent?"
//!
//! Causal model: `answer = continent(country1) == continent(country2)`.
//! Two alignment variants:
//! - `continent_map`: intervene on `continent(country1)`. The source's first
//!   country is drawn so that its continent matches (target "Yes") or does
//!   not match (target "No") the base's second country.
//! - `output_rep`: intervene on the answer itself. The source is any
//!   example whose own answer equals the target.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use super::{split_pool, yes_no, PromptStyle, Task, TaskData, TaskSizes};
use crate::data::TextExample;

const COUNTRIES: &[(&str, &str)] = &[
    ("Africa", "Nigeria"),
    ("Africa", "Egypt"),
    ("Africa", "Kenya"),
    ("Africa", "Ghana"),
    ("Africa", "Ethiopia"),
    ("Africa", "Morocco"),
    ("Africa", "Senegal"),
    ("Africa", "Tanzania"),
    ("Africa", "Uganda"),
    ("Africa", "Zambia"),
    ("Asia", "China"),
    ("Asia", "India"),
    ("Asia", "Japan"),
    ("Asia", "Vietnam"),
    ("Asia", "Thailand"),
    ("Asia", "Indonesia"),
    ("Asia", "Pakistan"),
    ("Asia", "Nepal"),
    ("Asia", "Mongolia"),
    ("Asia", "Malaysia"),
    ("Europe", "France"),
    ("Europe", "Germany"),
    ("Europe", "Italy"),
    ("Europe", "Spain"),
    ("Europe", "Poland"),
    ("Europe", "Sweden"),
    ("Europe", "Norway"),
    ("Europe", "Greece"),
    ("Europe", "Portugal"),
    ("Europe", "Ireland"),
    ("North America", "Canada"),
    ("North America", "Mexico"),
    ("North America", "Cuba"),
    ("North America", "Jamaica"),
    ("North America", "Guatemala"),
    ("North America", "Honduras"),
    ("North America", "Panama"),
    ("North America", "Haiti"),
    ("South America", "Brazil"),
    ("South America", "Argentina"),
    ("South America", "Chile"),
    ("South America", "Peru"),
    ("South America", "Colombia"),
    ("South America", "Venezuela"),
    ("South America", "Ecuador"),
    ("South America", "Uruguay"),
    ("South America", "Paraguay"),
    ("South America", "Bolivia"),
    ("Oceania", "Australia"),
    ("Oceania", "Fiji"),
    ("Oceania", "Samoa"),
    ("Oceania", "Tonga"),
    ("Oceania", "Vanuatu"),
    ("Oceania", "Kiribati"),
    ("Oceania", "Palau"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinentVariant {
    ContinentMap,
    OutputRep,
}

impl ContinentVariant {
    fn from_task_name(name: &str) -> Result<Self> {
        if name.contains("continent_map") {
            Ok(Self::ContinentMap)
        } else if name.contains("output_rep") {
            Ok(Self::OutputRep)
        } else {
            anyhow::bail!("Invalid continent matching task name: {name}")
        }
    }
}

pub struct ContinentMatching {
    name: String,
    variant: ContinentVariant,
    style: PromptStyle,
    by_continent: BTreeMap<&'static str, Vec<&'static str>>,
}

/// A country paired with its continent
type Placed = (&'static str, &'static str);

impl ContinentMatching {
    pub fn new(name: &str, style: PromptStyle) -> Result<Self> {
        let mut by_continent: BTreeMap<&'static str, Vec<&'static str>> = BTreeMap::new();
        for &(continent, country) in COUNTRIES {
            by_continent.entry(continent).or_default().push(country);
        }
        Ok(Self {
            name: name.to_string(),
            variant: ContinentVariant::from_task_name(name)?,
            style,
            by_continent,
        })
    }

    pub fn variant(&self) -> ContinentVariant {
        self.variant
    }

    fn prompt(&self, country1: &str, country2: &str) -> String {
        let question = format!(
            "Answer the following yes/no question:\n\nAre {country1} and {country2} on the same continent?"
        );
        self.style.render(&question, None)
    }

    fn any_country(&self, rng: &mut StdRng) -> Result<Placed> {
        let &(continent, country) = COUNTRIES.choose(rng).context("Empty country table")?;
        Ok((country, continent))
    }

    fn country_in(&self, continent: &str, rng: &mut StdRng) -> Result<Placed> {
        let (name, countries) = self
            .by_continent
            .get_key_value(continent)
            .with_context(|| format!("Unknown continent {continent}"))?;
        let country = countries.choose(rng).context("Continent has no countries")?;
        Ok((*country, *name))
    }

    fn country_outside(&self, continent: &str, rng: &mut StdRng) -> Result<Placed> {
        let others: Vec<&str> = self
            .by_continent
            .keys()
            .copied()
            .filter(|c| *c != continent)
            .collect();
        let other = others.choose(rng).context("No other continent")?;
        self.country_in(other, rng)
    }

    /// A plain example, optionally forced to a given answer
    fn single_example(&self, answer: Option<bool>, rng: &mut StdRng) -> Result<TextExample> {
        let (country1, continent1) = self.any_country(rng)?;
        let (country2, continent2) = match answer {
            None => self.any_country(rng)?,
            Some(true) => self.country_in(continent1, rng)?,
            Some(false) => self.country_outside(continent1, rng)?,
        };
        Ok(TextExample::plain(
            self.prompt(country1, country2),
            yes_no(continent1 == continent2),
        ))
    }

    /// Source countries whose intervened variable yields `target`
    fn sample_source(&self, base: (Placed, Placed), target: bool, rng: &mut StdRng) -> Result<(Placed, Placed)> {
        match self.variant {
            ContinentVariant::ContinentMap => {
                let (_, base_continent2) = base.1;
                let source1 = if target {
                    self.country_in(base_continent2, rng)?
                } else {
                    self.country_outside(base_continent2, rng)?
                };
                Ok((source1, self.any_country(rng)?))
            }
            ContinentVariant::OutputRep => {
                let source1 = self.any_country(rng)?;
                let source2 = if target {
                    self.country_in(source1.1, rng)?
                } else {
                    self.country_outside(source1.1, rng)?
                };
                Ok((source1, source2))
            }
        }
    }

    fn interchange_example(&self, rng: &mut StdRng) -> Result<TextExample> {
        let base = (self.any_country(rng)?, self.any_country(rng)?);
        let target = rng.gen_bool(0.5);
        let (source1, source2) = self.sample_source(base, target, rng)?;
        Ok(TextExample::interchange(
            self.prompt(base.0 .0, base.1 .0),
            self.prompt(source1.0, source2.0),
            yes_no(target),
            0,
        ))
    }
}

impl Task for ContinentMatching {
    fn name(&self) -> &str {
        &self.name
    }

    fn pad_to(&self) -> usize {
        match self.style {
            PromptStyle::Instruction => 80,
            PromptStyle::Plain => 40,
        }
    }

    fn sample(&self, sizes: TaskSizes, rng: &mut StdRng) -> Result<TaskData> {
        let mut prealign = Vec::with_capacity(sizes.n_eval);
        for _ in 0..sizes.n_eval / 2 {
            prealign.push(self.single_example(Some(true), rng)?);
            prealign.push(self.single_example(Some(false), rng)?);
        }

        let pool = (0..sizes.n_train + 2 * sizes.n_eval)
            .map(|_| self.interchange_example(rng))
            .collect::<Result<Vec<_>>>()?;
        let (train, dev, test) = split_pool(pool, sizes);

        Ok(TaskData {
            prealign,
            train,
            dev,
            test,
        })
    }
}

/// Continent of a country in the embedded table
pub fn continent_of(country: &str) -> Option<&'static str> {
    COUNTRIES
        .iter()
        .find(|(_, c)| *c == country)
        .map(|(continent, _)| *continent)
}

/// Parse the two countries back out of a rendered prompt
pub fn countries_in_prompt(prompt: &str) -> Option<(&str, &str)> {
    let rest = prompt.split("Are ").nth(1)?;
    let (first, rest) = rest.split_once(" and ")?;
    let (second, _) = rest.split_once(" on the same continent?")?;
    Some((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{NO_LABEL, YES_LABEL};
    use rand::SeedableRng;

    fn answer(prompt: &str) -> &'static str {
        let (a, b) = countries_in_prompt(prompt).unwrap();
        yes_no(continent_of(a).unwrap() == continent_of(b).unwrap())
    }

    #[test]
    fn test_prealign_is_balanced_and_correct() {
        let task = ContinentMatching::new("continent_matching_output_rep", PromptStyle::Instruction)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let data = task.sample(TaskSizes { n_train: 4, n_eval: 10 }, &mut rng).unwrap();
        assert_eq!(data.prealign.len(), 10);
        let yes = data.prealign.iter().filter(|e| e.target == YES_LABEL).count();
        assert_eq!(yes, 5);
        for example in &data.prealign {
            assert_eq!(answer(&example.prompt), example.target);
        }
        assert_eq!((data.train.len(), data.dev.len(), data.test.len()), (4, 10, 10));
    }

    #[test]
    fn test_output_rep_source_answers_target() {
        let task = ContinentMatching::new("continent_matching_output_rep", PromptStyle::Plain)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let data = task.sample(TaskSizes { n_train: 50, n_eval: 0 }, &mut rng).unwrap();
        for example in &data.train {
            let source = example.source_prompt.as_deref().unwrap();
            assert_eq!(answer(source), example.target);
        }
    }

    #[test]
    fn test_continent_map_source_matches_base_second_continent() {
        let task = ContinentMatching::new("continent_matching_continent_map", PromptStyle::Plain)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let data = task.sample(TaskSizes { n_train: 50, n_eval: 0 }, &mut rng).unwrap();
        let mut seen = [false, false];
        for example in &data.train {
            let (_, base2) = countries_in_prompt(&example.prompt).unwrap();
            let (source1, _) = countries_in_prompt(example.source_prompt.as_deref().unwrap()).unwrap();
            let expected = yes_no(continent_of(source1) == continent_of(base2));
            assert_eq!(expected, example.target);
            seen[(example.target == YES_LABEL) as usize] = true;
        }
        assert_eq!(seen, [true, true]);
        assert!(data.train.iter().all(|e| e.target == YES_LABEL || e.target == NO_LABEL));
    }

    #[test]
    fn test_same_seed_same_data() {
        let task = ContinentMatching::new("continent_matching_continent_map", PromptStyle::Plain)
            .unwrap();
        let sizes = TaskSizes { n_train: 5, n_eval: 4 };
        let a = task.sample(sizes, &mut StdRng::seed_from_u64(9)).unwrap();
        let b = task.sample(sizes, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.prealign, b.prealign);
    }
}
