// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause

// Feeds full_version() for the --version output of the binaries.
fn main() -> anyhow::Result<()> {
    vergen::EmitBuilder::builder()
        .build_date()
        .git_sha(true)
        .git_dirty(false)
        .cargo_target_triple()
        .emit()
}
