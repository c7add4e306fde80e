use crate::error::{McmcError, Result};
use crate::tensor::{self, Tensor};

/// Deterministic operators a vertex can apply to its parents.
///
/// Each variant carries three rules: `evaluate` for the value, `forward_diff`
/// (Jacobian-vector product) for tangents and `reverse_diff`
/// (vector-Jacobian product) for adjoints. Binary operators broadcast their
/// operands, so reverse mode sums adjoints back down to each operand's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Log,
    Square,
    Sin,
    Sigmoid,
    /// Sum of every element, producing a scalar.
    Sum,
    /// Pass-through. Resolved proxies are identities of their target.
    Identity,
    /// Element-wise `a > b` as 1.0 / 0.0. Not differentiable.
    GreaterThan,
}

impl Op {
    pub fn arity(&self) -> usize {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::GreaterThan => 2,
            _ => 1,
        }
    }

    pub fn is_differentiable(&self) -> bool {
        !matches!(self, Op::GreaterThan)
    }

    /// Output shape for the given operand shapes, validated once at construction.
    pub fn output_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        if inputs.len() != self.arity() {
            return Err(McmcError::InvalidVertex(format!(
                "{:?} takes {} operand(s), got {}",
                self,
                self.arity(),
                inputs.len()
            )));
        }
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::GreaterThan => {
                tensor::broadcast_shape(inputs[0], inputs[1])
            }
            Op::Sum => Ok(Vec::new()),
            _ => Ok(inputs[0].to_vec()),
        }
    }

    pub fn evaluate(&self, inputs: &[&Tensor]) -> Tensor {
        match self {
            Op::Add => inputs[0] + inputs[1],
            Op::Sub => inputs[0] - inputs[1],
            Op::Mul => inputs[0] * inputs[1],
            Op::Div => inputs[0] / inputs[1],
            Op::Neg => -inputs[0],
            Op::Exp => inputs[0].mapv(f64::exp),
            Op::Log => inputs[0].mapv(f64::ln),
            Op::Square => inputs[0].mapv(|x| x * x),
            Op::Sin => inputs[0].mapv(f64::sin),
            Op::Sigmoid => inputs[0].mapv(sigmoid),
            Op::Sum => tensor::scalar(inputs[0].sum()),
            Op::Identity => inputs[0].clone(),
            Op::GreaterThan => {
                (inputs[0] - inputs[1]).mapv(|d| if d > 0.0 { 1.0 } else { 0.0 })
            }
        }
    }

    /// Tangent of the output given operand tangents. `None` means zero.
    ///
    /// The result may be lower rank than `output` when only broadcast
    /// operands carry tangents; callers expand it to the output shape.
    pub fn forward_diff(
        &self,
        inputs: &[&Tensor],
        output: &Tensor,
        tangents: &[Option<&Tensor>],
    ) -> Option<Tensor> {
        let ta = tangents.first().copied().flatten();
        let tb = tangents.get(1).copied().flatten();

        match self {
            Op::Add => sum_opt(ta.cloned(), tb.cloned()),
            Op::Sub => sum_opt(ta.cloned(), tb.map(|t| -t)),
            Op::Mul => sum_opt(ta.map(|t| t * inputs[1]), tb.map(|t| inputs[0] * t)),
            Op::Div => {
                let b = inputs[1];
                sum_opt(
                    ta.map(|t| t / b),
                    tb.map(|t| -(inputs[0] * t) / &(b * b)),
                )
            }
            Op::Neg => ta.map(|t| -t),
            Op::Exp => ta.map(|t| t * output),
            Op::Log => ta.map(|t| t / inputs[0]),
            Op::Square => ta.map(|t| t * &(inputs[0] * 2.0)),
            Op::Sin => ta.map(|t| t * &inputs[0].mapv(f64::cos)),
            Op::Sigmoid => ta.map(|t| t * &output.mapv(|s| s * (1.0 - s))),
            Op::Sum => ta.map(|t| tensor::scalar(t.sum())),
            Op::Identity => ta.cloned(),
            Op::GreaterThan => None,
        }
    }

    /// Adjoint contributed to each operand, already reduced to that operand's shape.
    pub fn reverse_diff(
        &self,
        inputs: &[&Tensor],
        output: &Tensor,
        adjoint: &Tensor,
    ) -> Vec<Option<Tensor>> {
        let shape_a = inputs[0].shape();

        match self {
            Op::Add => vec![
                Some(tensor::sum_to(adjoint, shape_a)),
                Some(tensor::sum_to(adjoint, inputs[1].shape())),
            ],
            Op::Sub => vec![
                Some(tensor::sum_to(adjoint, shape_a)),
                Some(tensor::sum_to(&-adjoint, inputs[1].shape())),
            ],
            Op::Mul => vec![
                Some(tensor::sum_to(&(adjoint * inputs[1]), shape_a)),
                Some(tensor::sum_to(&(adjoint * inputs[0]), inputs[1].shape())),
            ],
            Op::Div => {
                let b = inputs[1];
                let db = -(adjoint * inputs[0]) / &(b * b);
                vec![
                    Some(tensor::sum_to(&(adjoint / b), shape_a)),
                    Some(tensor::sum_to(&db, b.shape())),
                ]
            }
            Op::Neg => vec![Some(-adjoint)],
            Op::Exp => vec![Some(adjoint * output)],
            Op::Log => vec![Some(adjoint / inputs[0])],
            Op::Square => vec![Some(adjoint * &(inputs[0] * 2.0))],
            Op::Sin => vec![Some(adjoint * &inputs[0].mapv(f64::cos))],
            Op::Sigmoid => vec![Some(adjoint * &output.mapv(|s| s * (1.0 - s)))],
            Op::Sum => vec![Some(tensor::filled(shape_a, adjoint.sum()))],
            Op::Identity => vec![Some(adjoint.clone())],
            Op::GreaterThan => vec![None, None],
        }
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn sum_opt(a: Option<Tensor>, b: Option<Tensor>) -> Option<Tensor> {
    match (a, b) {
        (Some(a), Some(b)) => Some(&a + &b),
        (a, None) => a,
        (None, b) => b,
    }
}
