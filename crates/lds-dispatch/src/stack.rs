use lds_core::{IValue, MAX_EXACT_DOUBLE_INT, TensorValue};

use crate::DispatchError;
use crate::registry::{OperatorHandle, Stack};

/// Builds a [`Stack`] from anything convertible into [`IValue`].
#[macro_export]
macro_rules! make_stack {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::IValue::from($value)),*]
    };
}

pub fn pop_ivalue(op: &OperatorHandle, stack: &mut Stack) -> Result<IValue, DispatchError> {
    stack
        .pop()
        .ok_or_else(|| op.kernel_error("boxed stack underflow"))
}

/// Removes the top `count` values, returned in push order.
pub fn pop_args(
    op: &OperatorHandle,
    stack: &mut Stack,
    count: usize,
) -> Result<Vec<IValue>, DispatchError> {
    if stack.len() < count {
        return Err(op.kernel_error(format!(
            "expected {count} arguments on the stack, found {}",
            stack.len()
        )));
    }
    Ok(stack.split_off(stack.len() - count))
}

pub fn pop_tensor(op: &OperatorHandle, stack: &mut Stack) -> Result<TensorValue, DispatchError> {
    match pop_ivalue(op, stack)? {
        IValue::Tensor(tensor) => Ok(tensor),
        other => Err(type_mismatch(op, "Tensor", &other)),
    }
}

pub fn pop_int(op: &OperatorHandle, stack: &mut Stack) -> Result<i64, DispatchError> {
    let value = pop_ivalue(op, stack)?;
    value.as_int().ok_or_else(|| type_mismatch(op, "int", &value))
}

/// Accepts an int in place of a float when the conversion is exact.
pub fn pop_double(op: &OperatorHandle, stack: &mut Stack) -> Result<f64, DispatchError> {
    let value = pop_ivalue(op, stack)?;
    match value {
        IValue::Int(int) if int.unsigned_abs() > MAX_EXACT_DOUBLE_INT => Err(op.kernel_error(
            format!("int {int} has no exact float representation"),
        )),
        _ => value
            .as_double()
            .ok_or_else(|| type_mismatch(op, "float", &value)),
    }
}

pub fn pop_bool(op: &OperatorHandle, stack: &mut Stack) -> Result<bool, DispatchError> {
    let value = pop_ivalue(op, stack)?;
    value.as_bool().ok_or_else(|| type_mismatch(op, "bool", &value))
}

fn type_mismatch(op: &OperatorHandle, expected: &str, found: &IValue) -> DispatchError {
    op.kernel_error(format!(
        "expected {expected} on the stack, found {}",
        found.type_name()
    ))
}
