use std::{env, error::Error, time::Duration};
use tracing_subscriber::EnvFilter;
use gnuplot_session::{CancelToken, Options};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Plot a damped sine and its envelope to the PNG file given as first
/// argument (default: `target/damped.png`).
fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let out = env::args().nth(1)
        .unwrap_or_else(|| "target/damped.png".to_string());
    let mut s = Options::new("target/damped", &out)
        .data("target/damped")
        .data("target/envelope")
        .create()?;
    s.cmds(["set terminal pngcairo size 800,500",
            "set output ${out}",
            "set grid",
            "plot ${dat:0} using 1:2 with lines title 'signal', \\",
            "     ${dat:1} using 1:2 with lines dt 2 title '+env', \\",
            "     ${dat:1} using 1:3 with lines dt 2 title '-env'"])?;
    for i in 0 .. 1000 {
        let x = i as f64 / 50.;
        let env = (-x / 8.).exp();
        s.data_row(0, [x.to_string(), (env * (3. * x).sin()).to_string()])?;
        s.data_row(1, [x.to_string(), env.to_string(), (-env).to_string()])?;
    }
    s.run(&CancelToken::with_timeout(Duration::from_secs(30)))?;
    println!("Wrote {}", out);
    Ok(())
}
