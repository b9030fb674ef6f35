

/// Address of the running service, `LIBRARYSERVICE_URL` overrides the default
#[cfg(test)]
fn service_url() -> String {
    std::env::var("LIBRARYSERVICE_URL").unwrap_or("http://127.0.0.1:8080".to_string())
}
