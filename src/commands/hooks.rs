//! Contains functionality of the hooks command
use std::io::{self, Write};

use anyhow::Result;
use clap::Parser;
use tabwriter::TabWriter;

use super::{load_configuration, load_hooks, GlobalOpts};
use crate::bundle::builder::ANNOTATION_MPI_TYPE;
use crate::hooks::{Condition, HookDescriptor, HookRegistry};

/// List the configured hooks
#[derive(Parser, Debug, Default)]
pub struct Hooks {
    /// Only list the MPI hooks together with the MPI type that activates them
    #[clap(short, long)]
    pub mpi: bool,
}

/// Value pattern of the condition on the MPI type annotation, if the hook has one.
fn mpi_type_of(hook: &HookDescriptor) -> Option<&str> {
    hook.conditions.iter().find_map(|condition| match condition {
        Condition::Annotations(pairs) => pairs
            .iter()
            .find(|(key, _)| key.is_match(ANNOTATION_MPI_TYPE))
            .map(|(_, value)| value.as_str()),
        _ => None,
    })
}

/// Whether the default MPI type of the installation activates the hook.
fn is_default_mpi_type(hook: &HookDescriptor, default_mpi_type: Option<&str>) -> bool {
    let default = match default_mpi_type {
        Some(default) => default,
        None => return false,
    };
    hook.conditions.iter().any(|condition| match condition {
        Condition::Annotations(pairs) => pairs
            .iter()
            .any(|(key, value)| key.is_match(ANNOTATION_MPI_TYPE) && value.is_match(default)),
        _ => false,
    })
}

pub fn render<W: Write>(
    out: W,
    registry: &HookRegistry,
    mpi: bool,
    default_mpi_type: Option<&str>,
) -> Result<()> {
    let mut tab_writer = TabWriter::new(out);
    if mpi {
        writeln!(&mut tab_writer, "NAME\tMPI TYPE")?;
        for hook in registry.hooks() {
            if let Some(mpi_type) = mpi_type_of(hook) {
                let suffix = if is_default_mpi_type(hook, default_mpi_type) {
                    " (default)"
                } else {
                    ""
                };
                writeln!(&mut tab_writer, "{}\t{}{}", hook.name, mpi_type, suffix)?;
            }
        }
    } else {
        writeln!(&mut tab_writer, "NAME\tPATH\tSTAGES")?;
        for hook in registry.hooks() {
            let stages: Vec<&str> = hook.stages.iter().map(|s| s.as_str()).collect();
            writeln!(
                &mut tab_writer,
                "{}\t{}\t{}",
                hook.name,
                hook.hook.path.display(),
                stages.join(", ")
            )?;
        }
    }
    tab_writer.flush()?;
    Ok(())
}

pub fn hooks(args: Hooks, global: &GlobalOpts) -> Result<()> {
    let config = load_configuration(global)?;
    let registry = load_hooks(&config)?;
    render(
        io::stdout(),
        &registry,
        args.mpi,
        config.default_mpi_type.as_deref(),
    )
}
