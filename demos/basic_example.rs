// Example for the README

use gnuplot_session::{CancelToken, Options};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut s = Options::new("target/basic", "target/basic_example.svg")
        .data("target/basic")
        .create()?;
    s.cmds(["set terminal svg", "set output ${out}",
            "plot ${dat:0} with linespoints notitle"])?;
    s.data_xy(0, &[1., 2., 3., 4.], &[1., 4., 2., 3.])?;
    s.run(&CancelToken::new())?;
    Ok(())
}
