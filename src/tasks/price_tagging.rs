//! "Say yes only if it costs between [lo] and [hi] dollars"
//!
//! Causal model with two boolean variables:
//! `left = amount >= lo`, `right = amount <= hi`, `answer = left && right`.
//! The `lb` variant aligns the left boundary variable, `ub` the right one.
//! The counterfactual target takes the aligned variable from the source
//! scenario and the other one from the base.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::Rng;

use super::{split_pool, yes_no, PromptStyle, Task, TaskData, TaskSizes};
use crate::data::TextExample;

/// Prices range over `0.00..=9.99`
const MAX_CENTS: u32 = 999;

/// Rejection-sampling budget for a scenario with a required answer
const MAX_TRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryVariant {
    Left,
    Right,
}

impl BoundaryVariant {
    fn from_task_name(name: &str) -> Result<Self> {
        if name.ends_with("lb") {
            Ok(Self::Left)
        } else if name.ends_with("ub") {
            Ok(Self::Right)
        } else {
            anyhow::bail!("Invalid price tagging task name (expected _lb or _ub): {name}")
        }
    }
}

/// One price question, amounts in cents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scenario {
    pub lo: u32,
    pub hi: u32,
    pub amount: u32,
}

impl Scenario {
    fn sample(rng: &mut StdRng) -> Self {
        let lo = rng.gen_range(0..MAX_CENTS);
        let hi = rng.gen_range(lo + 1..=MAX_CENTS);
        Self {
            lo,
            hi,
            amount: rng.gen_range(0..=MAX_CENTS),
        }
    }

    pub fn left(&self) -> bool {
        self.amount >= self.lo
    }

    pub fn right(&self) -> bool {
        self.amount <= self.hi
    }

    pub fn answer(&self) -> bool {
        self.left() && self.right()
    }
}

fn dollars(cents: u32) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

pub struct PriceTagging {
    name: String,
    variant: BoundaryVariant,
    style: PromptStyle,
}

impl PriceTagging {
    pub fn new(name: &str, style: PromptStyle) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            variant: BoundaryVariant::from_task_name(name)?,
            style,
        })
    }

    pub fn variant(&self) -> BoundaryVariant {
        self.variant
    }

    pub fn prompt(&self, scenario: &Scenario) -> String {
        let instruction = format!(
            "Please say yes only if it costs between [{}] and [{}] dollars, otherwise no.",
            dollars(scenario.lo),
            dollars(scenario.hi)
        );
        let input = format!("{} dollars", dollars(scenario.amount));
        self.style.render(&instruction, Some(&input))
    }

    /// Answer after taking the aligned variable from `source`
    pub fn counterfactual(&self, base: &Scenario, source: &Scenario) -> bool {
        match self.variant {
            BoundaryVariant::Left => source.left() && base.right(),
            BoundaryVariant::Right => base.left() && source.right(),
        }
    }

    fn scenario_with_answer(&self, answer: bool, rng: &mut StdRng) -> Result<Scenario> {
        for _ in 0..MAX_TRIES {
            let scenario = Scenario::sample(rng);
            if scenario.answer() == answer {
                return Ok(scenario);
            }
        }
        anyhow::bail!("Could not sample a price scenario answering {answer}")
    }

    fn interchange_example(&self, rng: &mut StdRng) -> Result<TextExample> {
        let target = rng.gen_bool(0.5);
        for _ in 0..MAX_TRIES {
            let base = Scenario::sample(rng);
            let source = Scenario::sample(rng);
            if self.counterfactual(&base, &source) == target {
                return Ok(TextExample::interchange(
                    self.prompt(&base),
                    self.prompt(&source),
                    yes_no(target),
                    0,
                ));
            }
        }
        anyhow::bail!("Could not sample an interchange pair with target {target}")
    }
}

impl Task for PriceTagging {
    fn name(&self) -> &str {
        &self.name
    }

    fn pad_to(&self) -> usize {
        match self.style {
            PromptStyle::Instruction => 96,
            PromptStyle::Plain => 48,
        }
    }

    fn sample(&self, sizes: TaskSizes, rng: &mut StdRng) -> Result<TaskData> {
        let mut prealign = Vec::with_capacity(sizes.n_eval);
        for _ in 0..sizes.n_eval / 2 {
            for answer in [true, false] {
                let scenario = self.scenario_with_answer(answer, rng)?;
                prealign.push(TextExample::plain(self.prompt(&scenario), yes_no(answer)));
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{NO_LABEL, YES_LABEL};
    use rand::SeedableRng;

    fn cents(text: &str) -> u32 {
        let (whole, frac) = text.split_once('.').unwrap();
        whole.parse::<u32>().unwrap() * 100 + frac.parse::<u32>().unwrap()
    }

    /// Recover the scenario from a rendered prompt
    fn parse(prompt: &str) -> Scenario {
        let between = prompt.split("between [").nth(1).unwrap();
        let (lo, rest) = between.split_once("] and [").unwrap();
        let (hi, _) = rest.split_once("] dollars").unwrap();
        let input = prompt.split("### Input:\n").nth(1).unwrap();
        let (amount, _) = input.split_once(" dollars").unwrap();
        Scenario {
            lo: cents(lo),
            hi: cents(hi),
            amount: cents(amount),
        }
    }

    #[test]
    fn test_variant_from_name() {
        assert_eq!(
            PriceTagging::new("price_tagging_lb", PromptStyle::Instruction).unwrap().variant(),
            BoundaryVariant::Left
        );
        assert_eq!(
            PriceTagging::new("price_tagging_ub", PromptStyle::Instruction).unwrap().variant(),
            BoundaryVariant::Right
        );
        assert!(PriceTagging::new("price_tagging", PromptStyle::Instruction).is_err());
    }

    #[test]
    fn test_prompt_format() {
        let task = PriceTagging::new("price_tagging_lb", PromptStyle::Instruction).unwrap();
        let scenario = Scenario {
            lo: 130,
            hi: 855,
            amount: 7,
        };
        let prompt = task.prompt(&scenario);
        assert!(prompt.contains("between [1.30] and [8.55] dollars, otherwise no."));
        assert!(prompt.contains("### Input:\n0.07 dollars"));
        assert_eq!(parse(&prompt), scenario);
    }

    #[test]
    fn test_prealign_answers_follow_causal_model() {
        let task = PriceTagging::new("price_tagging_ub", PromptStyle::Instruction).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let data = task.sample(TaskSizes { n_train: 2, n_eval: 8 }, &mut rng).unwrap();
        assert_eq!(data.prealign.len(), 8);
        for example in &data.prealign {
            assert_eq!(yes_no(parse(&example.prompt).answer()), example.target);
        }
        let yes = data.prealign.iter().filter(|e| e.target == YES_LABEL).count();
        assert_eq!(yes, 4);
    }

    #[test]
    fn test_counterfactual_targets() {
        for name in ["price_tagging_lb", "price_tagging_ub"] {
            let task = PriceTagging::new(name, PromptStyle::Instruction).unwrap();
            let mut rng = StdRng::seed_from_u64(4);
            let data = task.sample(TaskSizes { n_train: 40, n_eval: 5 }, &mut rng).unwrap();
            assert_eq!((data.train.len(), data.dev.len(), data.test.len()), (40, 5, 5));
            for example in data.train.iter().chain(&data.dev) {
                let base = parse(&example.prompt);
                let source = parse(example.source_prompt.as_deref().unwrap());
                assert_eq!(yes_no(task.counterfactual(&base, &source)), example.target);
            }
            assert!(data.train.iter().any(|e| e.target == NO_LABEL));
            assert!(data.train.iter().any(|e| e.target == YES_LABEL));
        }
    }
}
