//! Including another recipe.
//!
//! ```yaml
//! - action: recipe
//!   recipe: common/users.yaml
//!   variables:
//!     username: pi
//! ```
//!
//! The included recipe gets its own origins and recipe directory, but
//! shares everything else (root directory, image, ...) with the includer.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context as _, Result};
use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::action::{describe_or, Action, ActionKind};
use crate::context::{Context, RecipeScope};
use crate::machine::Machine;
use crate::pipeline::merge;
use crate::recipe::Recipe;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RecipeAction {
    #[serde(default)]
    description: Option<String>,
    /// Path of the recipe, relative to the including recipe's directory.
    recipe: String,
    /// Template variables for the included recipe.
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(skip)]
    scope: Option<RecipeScope>,
    #[serde(skip)]
    actions: Vec<ActionKind>,
    /// Children whose pre-machine phase ran.
    #[serde(skip)]
    pre_ran: usize,
    /// Children whose run phase began.
    #[serde(skip)]
    run_began: usize,
}

fn not_verified() -> anyhow::Error {
    anyhow!("Included recipe was not verified")
}

impl Action for RecipeAction {
    fn verify(&mut self, ctx: &mut Context) -> Result<()> {
        let path = ctx.scope.recipe_dir.join(&self.recipe);
        let recipe = Recipe::load(&path, &self.variables)?;
        if let Some(arch) = recipe.architecture.as_deref() {
            if arch != ctx.scope.architecture {
                anyhow::bail!(
                    "Included recipe {path} is for {arch}, not {}",
                    ctx.scope.architecture
                );
            }
        }
        let dir = path
            .parent()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        let mut scope = ctx.scope.nested(dir);
        let mut actions = recipe.actions;
        ctx.with_scope(&mut scope, |ctx| {
            for a in actions.iter_mut() {
                a.verify(ctx)
                    .with_context(|| format!("Verifying action `{}`", a.describe()))?;
            }
            anyhow::Ok(())
        })
        .with_context(|| format!("In recipe {path}"))?;
        self.scope = Some(scope);
        self.actions = actions;
        Ok(())
    }

    fn pre_machine(
        &mut self,
        ctx: &mut Context,
        machine: &mut dyn Machine,
        args: &mut Vec<String>,
    ) -> Result<()> {
        let Self {
            scope,
            actions,
            pre_ran,
            ..
        } = self;
        let scope = scope.as_mut().ok_or_else(not_verified)?;
        machine.add_volume(&scope.recipe_dir);
        ctx.with_scope(scope, |ctx| {
            for a in actions.iter_mut() {
                *pre_ran += 1;
                a.pre_machine(ctx, machine, args)?;
            }
            Ok(())
        })
    }

    fn pre_no_machine(&mut self, ctx: &mut Context) -> Result<()> {
        let Self {
            scope,
            actions,
            pre_ran,
            ..
        } = self;
        let scope = scope.as_mut().ok_or_else(not_verified)?;
        ctx.with_scope(scope, |ctx| {
            for a in actions.iter_mut() {
                *pre_ran += 1;
                a.pre_no_machine(ctx)?;
            }
            Ok(())
        })
    }

    fn run(&mut self, ctx: &mut Context) -> Result<()> {
        let Self {
            scope,
            actions,
            run_began,
            ..
        } = self;
        let scope = scope.as_mut().ok_or_else(not_verified)?;
        ctx.with_scope(scope, |ctx| {
            for a in actions.iter_mut() {
                *run_began += 1;
                tracing::info!("==> {}", a.describe());
                a.run(ctx)?;
            }
            Ok(())
        })
    }

    fn cleanup(&mut self, ctx: &mut Context) -> Result<()> {
        let Self {
            scope,
            actions,
            run_began,
            ..
        } = self;
        let scope = scope.as_mut().ok_or_else(not_verified)?;
        ctx.with_scope(scope, |ctx| {
            let mut r = Ok(());
            for a in actions[..*run_began].iter_mut().rev() {
                r = merge(r, a.cleanup(ctx));
            }
            r
        })
    }

    fn post_machine(&mut self, ctx: &mut Context) -> Result<()> {
        let Self {
            scope,
            actions,
            pre_ran,
            ..
        } = self;
        let scope = scope.as_mut().ok_or_else(not_verified)?;
        ctx.with_scope(scope, |ctx| {
            for a in actions[..*pre_ran].iter_mut() {
                a.post_machine(ctx)?;
            }
            Ok(())
        })
    }

    fn post_machine_cleanup(&mut self, ctx: &mut Context) -> Result<()> {
        let Self {
            scope,
            actions,
            pre_ran,
            ..
        } = self;
        let scope = scope.as_mut().ok_or_else(not_verified)?;
        ctx.with_scope(scope, |ctx| {
            let mut r = Ok(());
            for a in actions[..*pre_ran].iter_mut().rev() {
                r = merge(r, a.post_machine_cleanup(ctx));
            }
            r
        })
    }

    fn describe(&self) -> String {
        describe_or(self.description.as_deref(), || {
            format!("Recipe {}", self.recipe)
        })
    }
}
