use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::{Error, InstrOutput, Program, Result, RuntimeCtx};

/// Execute a program: resolve every instruction's parameters in emission
/// (dependency) order on a single logical task, then hand back the root's
/// output. Value and callable outputs are shared between consumers; a row
/// stream moves into its single consumer, and pulling it drives the whole
/// pipeline lazily from there.
pub fn run_program(
    program: Arc<Program>,
    ctx: Arc<RuntimeCtx>,
) -> BoxFuture<'static, Result<InstrOutput>> {
    async move {
        let mut outputs: Vec<Option<InstrOutput>> =
            (0..program.instructions.len()).map(|_| None).collect();

        for (address, instruction) in program.instructions.iter().enumerate() {
            let mut params = Vec::with_capacity(instruction.params.len());
            for &source in &instruction.params {
                params.push(take_param(&mut outputs, source)?);
            }
            ctx.trace("instruction", &instruction.note);
            let output = (instruction.run)(ctx.clone(), params).await?;
            outputs[address] = Some(output);
        }

        let root = program.root();
        outputs
            .get_mut(root)
            .and_then(Option::take)
            .ok_or_else(|| Error::Internal("program produced no root output".into()))
    }
    .boxed()
}

fn take_param(outputs: &mut [Option<InstrOutput>], source: usize) -> Result<InstrOutput> {
    let slot = outputs
        .get_mut(source)
        .ok_or_else(|| Error::Internal(format!("instruction parameter {source} out of order")))?;
    // Streams move into their single consumer; everything else is shared.
    if matches!(slot, Some(InstrOutput::Rows(_))) {
        return slot
            .take()
            .ok_or_else(|| Error::Internal("row stream vanished".into()));
    }
    match slot.as_ref() {
        Some(InstrOutput::Value(value)) => Ok(InstrOutput::Value(value.clone())),
        Some(InstrOutput::Callable(callable)) => Ok(InstrOutput::Callable(callable.clone())),
        Some(InstrOutput::Void) => Ok(InstrOutput::Void),
        Some(InstrOutput::Rows(_)) => unreachable!("handled above"),
        None => Err(Error::Internal(
            "row-stream output consumed by two instructions".into(),
        )),
    }
}
