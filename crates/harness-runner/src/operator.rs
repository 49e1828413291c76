use crate::error::HarnessError;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operator {
    DeleteVoidFunctionCall,
    FlipArithmeticOperator,
    FlipBooleanOperator,
    FlipRelationalOperator,
    UndoTransformation,
    DeleteConditionalControlFlow,
    FlipSignedness,
}

impl Operator {
    pub const ALL: [Operator; 7] = [
        Operator::DeleteVoidFunctionCall,
        Operator::FlipArithmeticOperator,
        Operator::FlipBooleanOperator,
        Operator::FlipRelationalOperator,
        Operator::UndoTransformation,
        Operator::DeleteConditionalControlFlow,
        Operator::FlipSignedness,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::DeleteVoidFunctionCall => "delete-void-function-call",
            Operator::FlipArithmeticOperator => "flip-arithmetic-operator",
            Operator::FlipBooleanOperator => "flip-boolean-operator",
            Operator::FlipRelationalOperator => "flip-relational-operator",
            Operator::UndoTransformation => "undo-transformation",
            Operator::DeleteConditionalControlFlow => "delete-conditional-control-flow",
            Operator::FlipSignedness => "flip-signedness",
        }
    }

    pub fn choose<R: Rng + ?Sized>(rng: &mut R) -> Operator {
        // ALL is non-empty, so choose always yields.
        *Self::ALL
            .choose(rng)
            .unwrap_or(&Operator::DeleteVoidFunctionCall)
    }

    pub fn resolve<R: Rng + ?Sized>(configured: Option<Operator>, rng: &mut R) -> Operator {
        configured.unwrap_or_else(|| Self::choose(rng))
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s.trim())
            .ok_or_else(|| {
                HarnessError::Configuration(format!(
                    "unknown operator '{}': expected one of {}",
                    s,
                    Self::ALL
                        .iter()
                        .map(|op| op.as_str())
                        .collect::<Vec<_>>()
                        .join("|")
                ))
            })
    }
}
