//! The sandbox helper binary. The engine spawns it with an empty argv and
//! writes a JSON init request to its standard input; everything else lives in
//! `sandbox::helper`.

fn main() {
    sandbox::helper_main()
}
