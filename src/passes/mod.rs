//! Legalization and optimization passes.
//!
//! The pass manager runs two phases over the fixed-up module:
//!
//! 1. **Legalize**: intrinsic lowering and stack-slot scalarization, each run
//!    once. Everything after this point may assume the module only calls real
//!    functions.
//! 2. **Optimize** (when enabled): CFG simplification, inlining, loop-invariant
//!    code motion and dead-code elimination, repeated until no pass reports a
//!    change or the iteration limit is reached.
//!
//! The verifier is not a pass; the pipeline calls [`verify::verify_module`]
//! after the manager finishes.

pub mod dce;
pub mod inline;
pub mod intrinsics;
pub mod licm;
pub mod scalarize;
pub mod simplify_cfg;
pub mod verify;

pub use dce::DeadCodeElimination;
pub use inline::Inliner;
pub use intrinsics::IntrinsicLowering;
pub use licm::LoopInvariantMotion;
pub use scalarize::Scalarize;
pub use simplify_cfg::SimplifyCfg;
pub use verify::verify_module;

use crate::core::error::CompileResult;
use crate::core::session::{CompilationContext, CompileOptions};
use crate::ir::Module;

/// A transformation over a whole module.
///
/// Passes receive mutable access to the module and shared access to the
/// compilation context, which they use for options and statistics.
pub trait ModulePass {
    /// Unique name for logging.
    fn name(&self) -> &'static str;

    /// Run the pass. Returns `true` if the module changed.
    fn run(&self, module: &mut Module, ctx: &CompilationContext<'_>) -> CompileResult<bool>;
}

/// Runs the legalize phase once and the optimize phase to a fixpoint.
pub struct PassManager {
    max_iterations: usize,
    pub legalize: Vec<Box<dyn ModulePass>>,
    pub optimize: Vec<Box<dyn ModulePass>>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new(8)
    }
}

impl PassManager {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            legalize: Vec::new(),
            optimize: Vec::new(),
        }
    }

    /// The standard pipeline for the given options.
    pub fn for_options(options: &CompileOptions) -> Self {
        let mut manager = Self::default();
        manager.legalize.push(Box::new(IntrinsicLowering));
        manager.legalize.push(Box::new(Scalarize));
        if options.optimize {
            manager.optimize.push(Box::new(SimplifyCfg));
            manager.optimize.push(Box::new(Inliner::new(options.inline_threshold)));
            if options.licm {
                manager.optimize.push(Box::new(LoopInvariantMotion));
            }
            manager.optimize.push(Box::new(DeadCodeElimination));
        }
        manager
    }

    /// Pass names in execution order.
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.legalize
            .iter()
            .chain(&self.optimize)
            .map(|pass| pass.name())
            .collect()
    }

    /// Run both phases. Returns the number of optimize iterations performed.
    pub fn run(&self, module: &mut Module, ctx: &CompilationContext<'_>) -> CompileResult<usize> {
        for pass in &self.legalize {
            let changed = pass.run(module, ctx)?;
            log::debug!("legalize: {} (changed: {changed})", pass.name());
        }

        let mut iterations = 0;
        while iterations < self.max_iterations && !self.optimize.is_empty() {
            iterations += 1;
            let mut changed = false;
            for pass in &self.optimize {
                let pass_changed = pass.run(module, ctx)?;
                log::trace!("iteration {iterations}: {} (changed: {pass_changed})", pass.name());
                changed |= pass_changed;
            }
            if !changed {
                break;
            }
        }
        log::info!(
            "passes: {} legalize, {} optimize, {iterations} iterations",
            self.legalize.len(),
            self.optimize.len()
        );
        Ok(iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    #[test]
    fn standard_pipeline_follows_options() {
        let mut options = CompileOptions::default();
        assert_eq!(
            PassManager::for_options(&options).pass_names(),
            vec!["lower-intrinsics", "scalarize", "simplify-cfg", "inline", "licm", "dce"]
        );
        options.licm = false;
        assert!(!PassManager::for_options(&options).pass_names().contains(&"licm"));
        options.optimize = false;
        assert_eq!(
            PassManager::for_options(&options).pass_names(),
            vec!["lower-intrinsics", "scalarize"]
        );
    }

    #[test]
    fn optimize_phase_stops_at_fixpoint() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let mut module = crate::ir::parse_module(
            r#"
define @main(i64 %n) -> i64 {
entry:
    %dead = add i64 %n, 1
    ret %n
}
"#,
        )
        .unwrap();
        let manager = PassManager::for_options(ctx.options());
        let iterations = manager.run(&mut module, &ctx).unwrap();
        assert!(iterations >= 2);
        assert!(iterations < 8);
        assert_eq!(module.functions[0].blocks[0].insts.len(), 1);
    }
}
