// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod dispose;
pub mod force_update;
pub mod interceptors;
pub mod observe;
pub mod replay;
pub mod retry;
