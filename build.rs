//! Packs the `web/` directory into a tar archive embedded by `server/assets.rs`.

use std::env;
use std::fs::File;
use std::path::Path;

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let archive_path = Path::new(&out_dir).join("assets.tar");

    let file = File::create(&archive_path).expect("create assets.tar");
    let mut builder = tar::Builder::new(file);
    builder
        .append_dir_all(".", "web")
        .expect("append web/ to assets.tar");
    builder.finish().expect("finish assets.tar");

    println!("cargo:rerun-if-changed=web");
}
