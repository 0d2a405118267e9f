use log as _;
use serde as _;
use toml as _;
use types as _;
use vapdisk_layout::DiskConfig;
use schemars::schema_for;

fn main() {
    let schema = schema_for!(DiskConfig);
    println!("{}", serde_json::to_string_pretty(&schema).unwrap());
}
