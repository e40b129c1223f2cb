//! `#[serde(serialize_with = "serde_addr::serialize")]` for addresses held as
//! `usize`: they are written as `0x...` strings, which is how every report
//! prints them.

use serde::Serializer;

pub fn serialize<S>(address: &usize, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&format_args!("{address:#x}"))
}
