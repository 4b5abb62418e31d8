//! The actions a recipe can use.

mod filesystem_deploy;
mod image_partition;
mod overlay;
mod raw;
mod recipe;
mod run;

pub(crate) use filesystem_deploy::FilesystemDeployAction;
pub(crate) use image_partition::ImagePartitionAction;
pub(crate) use overlay::OverlayAction;
pub(crate) use raw::RawAction;
pub(crate) use recipe::RecipeAction;
pub(crate) use run::RunAction;

fn default_true() -> bool {
    true
}
