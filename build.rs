use vergen::{BuildBuilder, Emitter};
use vergen_git2::Git2Builder;

// Emits VERGEN_BUILD_DATE and VERGEN_GIT_DESCRIBE for `causerie --version`.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let build = BuildBuilder::default().build_date(true).build()?;

    // Source tarballs have no repository to describe.
    match Git2Builder::default().describe(true, true, None).build() {
        Ok(git2) => {
            Emitter::default()
                .add_instructions(&build)?
                .add_instructions(&git2)?
                .emit()?;
        }
        Err(_) => {
            println!("cargo:rustc-env=VERGEN_GIT_DESCRIBE=unknown");
            Emitter::default().add_instructions(&build)?.emit()?;
        }
    }

    Ok(())
}
