//! GPU resource layouts shared by the bake passes

mod bindgroup;

pub use bindgroup::BindGroupLayouts;
