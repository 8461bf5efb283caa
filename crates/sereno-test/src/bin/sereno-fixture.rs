//! Host binary used by the scenario tests.

fn main() {
    let catalog = std::env::var(sereno_test::FIXTURE_ENV)
        .map(|spec| sereno_test::fixture_catalog(&spec))
        .unwrap_or_else(|_| sereno_test::fixture_catalog("ping"));
    std::process::exit(sereno::cli::main(catalog));
}
