//! Image build planning and building.
//!
//! [`plan`] turns a project directory plus mode flags into a deterministic
//! [`BuildRecipe`]; [`DockerBuilder`] hands the recipe to the external
//! builder and reports the resulting image reference.

mod context;
mod docker;
mod error;
mod recipe;

pub use context::{BuildContext, ExclusionList, DOCKERIGNORE_FILE};
pub use docker::DockerBuilder;
pub use error::{RecipeError, RecipeResult};
pub use recipe::{
    default_base_image, host_uid_gid, plan, BuildParams, BuildRecipe, LayerDirective, CREDS_DIR,
    DEFAULT_WORKDIR,
};
