//! Generate [gnuplot][] scripts and data files, then render them.
//!
//! Usage
//! -----
//!
//! A [`Session`] owns a script file (extension `.gplt`) and any number
//! of data files (extension `.dat`).  Commands appended to the script
//! may refer to the generated files through placeholders:
//!
//! - `${out}` is replaced by the output path, single-quoted;
//! - `${dat:N}` is replaced by the path of the `N`th data file,
//!   single-quoted.
//!
//! Placeholders do not nest: the text between `${` and `}` may not
//! contain `{`.
//!
//! ```no_run
//! use gnuplot_session::{CancelToken, Options};
//! let mut s = Options::new("target/sin", "target/sin.png")
//!     .data("target/sin")
//!     .create()?;
//! s.cmds(["set terminal png", "set output ${out}",
//!         "plot ${dat:0} with lines"])?;
//! let x: Vec<_> = (0 .. 100).map(|i| i as f64 / 10.).collect();
//! let y: Vec<_> = x.iter().map(|x| x.sin()).collect();
//! s.data_xy(0, &x, &y)?;
//! s.run(&CancelToken::new())?;
//! # Ok::<(), gnuplot_session::Error>(())
//! ```
//!
//! [gnuplot]: http://www.gnuplot.info/

use std::{
    ffi::{OsStr, OsString},
    fmt::{self, Debug, Display, Formatter},
    fs::File,
    io::{self, BufWriter, Write},
    num::ParseIntError,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, trace};
use wait_timeout::ChildExt;

#[cfg(feature = "curve-sampling")]
use curve_sampling::Sampling;

#[cfg(doctest)]
doc_comment::doctest!("../README.md");

/// Extension appended to the script path.
pub const SCRIPT_EXT: &str = "gplt";
/// Extension appended to every data path.
pub const DATA_EXT: &str = "dat";

/// How often a running renderer is checked for cancellation.
const POLL: Duration = Duration::from_millis(20);

lazy_static! {
    // `${...}` with no `{` inside.  Matches are non-overlapping and
    // found left to right.
    static ref OP: Regex = Regex::new(r"\$\{[^{]*\}").unwrap();
}

/// Possible errors of session functions.
#[derive(Debug)]
pub enum Error {
    /// A script or data file could not be created.
    Create { path: PathBuf, source: io::Error },
    /// The field separator does not fit in a single ASCII byte.
    Separator(char),
    /// A path that gnuplot commands would refer to is not valid UTF-8.
    NonUtf8Path(PathBuf),
    /// The placeholder names an operation other than `out` or `dat`.
    UnknownOp(String),
    /// A `dat` placeholder without its `:<idx>` part.
    MalformedDatOp(String),
    /// The index of a `dat` placeholder is not a number.
    DatIndex { index: String, source: ParseIntError },
    /// The data file index is not in `[0, len)`.
    IndexOutOfRange { index: i64, len: usize },
    /// Writing or flushing a generated file failed.
    Io(io::Error),
    /// Writing a data row failed.
    Csv(csv::Error),
    /// The renderer could not be launched.
    Spawn { program: OsString, source: io::Error },
    /// The renderer exited unsuccessfully.
    Exit(ExitStatus),
    /// The [`CancelToken`] was cancelled.
    Cancelled,
    /// The deadline of the [`CancelToken`] passed.
    TimedOut,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Error::Create { path, source } =>
                write!(f, "Cannot create {}: {}", path.display(), source),
            Error::Separator(c) =>
                write!(f, "The separator {:?} is not a single ASCII \
                           character", c),
            Error::NonUtf8Path(path) =>
                write!(f, "The path {} is not valid UTF-8", path.display()),
            Error::UnknownOp(op) =>
                write!(f, "Invalid op: Got: {}", op),
            Error::MalformedDatOp(op) =>
                write!(f, "Invalid dat op: Expected format: dat:<idx> \
                           Got: {}", op),
            Error::DatIndex { index, .. } =>
                write!(f, "Invalid dat op: Index {:?} was not a valid \
                           number: Expected format: dat:<idx>", index),
            Error::IndexOutOfRange { index, len } =>
                write!(f, "Dat file index out of range: Got: {} \
                           Allowed Range: [0, {})", index, len),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Csv(e) => write!(f, "Data row error: {}", e),
            Error::Spawn { program, source } =>
                write!(f, "Cannot launch {:?}: {}", program, source),
            Error::Exit(status) =>
                write!(f, "The renderer failed: {}", status),
            Error::Cancelled => write!(f, "The renderer was cancelled"),
            Error::TimedOut => write!(f, "The renderer timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Create { source, .. } => Some(source),
            Error::DatIndex { source, .. } => Some(source),
            Error::Io(e) => Some(e),
            Error::Csv(e) => Some(e),
            Error::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self { Error::Io(e) }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self { Error::Csv(e) }
}


/// Configuration of a [`Session`].
///
/// The order in which data files are added matters: placeholders and
/// [`Session::data_row`] refer to them by index.
#[derive(Debug, Clone)]
pub struct Options {
    script: PathBuf,
    data: Vec<PathBuf>,
    out: PathBuf,
    sep: char,
    program: OsString,
}

impl Options {
    /// Options for a session writing its script to `script` (to which
    /// `.gplt` is appended) and whose plot will go to `out`.  The
    /// output file is created by the renderer itself.
    pub fn new(script: impl AsRef<Path>, out: impl AsRef<Path>) -> Options {
        Options {
            script: script.as_ref().to_path_buf(),
            data: vec![],
            out: out.as_ref().to_path_buf(),
            sep: ' ',
            program: OsString::from("gnuplot"),
        }
    }

    /// Add a data file.  `.dat` is appended to `path`.
    pub fn data(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.data.push(path.as_ref().to_path_buf());
        self
    }

    /// Column separator of the data files.  Default: a space, which
    /// gnuplot reads without further configuration.
    pub fn separator(&mut self, sep: char) -> &mut Self {
        self.sep = sep;
        self
    }

    /// The renderer to launch.  Default: `gnuplot`.
    pub fn program(&mut self, program: impl AsRef<OsStr>) -> &mut Self {
        self.program = program.as_ref().to_os_string();
        self
    }

    /// Create the session.  Same as [`Session::new`].
    pub fn create(&self) -> Result<Session, Error> {
        Session::new(self)
    }
}


/// Signal telling [`Session::run`] to stop the renderer.
///
/// Clones share the same state, so a token may be cancelled from
/// another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that is only cancelled by [`CancelToken::cancel`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also fires once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Cancel this token and all its clones.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the token was cancelled or its deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    fn reason(&self) -> Option<Error> {
        if self.cancelled.load(Ordering::SeqCst) {
            Some(Error::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Error::TimedOut)
        } else {
            None
        }
    }
}


struct DataFile {
    path: PathBuf,
    quoted: String,
    writer: csv::Writer<File>,
    // Shares the cursor of the file inside `writer`.  Used to emit
    // bare newlines, which the csv writer would quote.
    raw: File,
    rows: usize,
}

impl DataFile {
    fn create(path: PathBuf, quoted: String, sep: u8)
              -> Result<DataFile, Error> {
        let file = create(&path)?;
        let raw = file.try_clone()?;
        let writer = csv::WriterBuilder::new()
            .delimiter(sep)
            .has_headers(false)
            .flexible(true)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);
        Ok(DataFile { path, quoted, writer, raw, rows: 0 })
    }

    fn blank_line(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        self.raw.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }
}

/// Handle on a gnuplot script, its data files and its output.
///
/// All files are created by [`Session::new`] and closed by
/// [`Session::run`], which consumes the session.
pub struct Session {
    out: PathBuf,
    out_quoted: String,
    script_path: PathBuf,
    script: BufWriter<File>,
    data: Vec<DataFile>,
    program: OsString,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("script", &self.script_path)
            .field("data", &self.data.iter().map(|d| &d.path)
                   .collect::<Vec<_>>())
            .field("out", &self.out)
            .field("program", &self.program)
            .finish()
    }
}

/// Append `.ext` to `path`, keeping any extension it already has.
fn with_extension(path: &Path, ext: &str) -> PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(".");
    p.push(ext);
    PathBuf::from(p)
}

fn create(path: &Path) -> Result<File, Error> {
    let file = File::create(path).map_err(|source| {
        Error::Create { path: path.to_path_buf(), source } })?;
    debug!(path = %path.display(), "created file");
    Ok(file)
}

/// `path` as a gnuplot single-quoted string.
fn quote(path: &Path) -> Result<String, Error> {
    let p = path.to_str()
        .ok_or_else(|| Error::NonUtf8Path(path.to_path_buf()))?;
    Ok(format!("'{}'", p.replace('\'', "''")))
}

impl Session {
    /// Create the script file and all data files described by `opts`.
    ///
    /// All paths must be valid UTF-8, since placeholders insert them
    /// verbatim in the script; otherwise no file is created.  Files
    /// already created are closed (but not removed) if a later one
    /// cannot be created.
    pub fn new(opts: &Options) -> Result<Session, Error> {
        let sep = u8::try_from(opts.sep).ok()
            .filter(|b| b.is_ascii())
            .ok_or(Error::Separator(opts.sep))?;
        let script_path = with_extension(&opts.script, SCRIPT_EXT);
        quote(&script_path)?;
        let out_quoted = quote(&opts.out)?;
        let data_paths = opts.data.iter()
            .map(|p| {
                let path = with_extension(p, DATA_EXT);
                quote(&path).map(|q| (path, q)) })
            .collect::<Result<Vec<_>, _>>()?;
        let script = BufWriter::new(create(&script_path)?);
        let data = data_paths.into_iter()
            .map(|(path, quoted)| DataFile::create(path, quoted, sep))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Session { out: opts.out.clone(),
                     out_quoted,
                     script_path,
                     script,
                     data,
                     program: opts.program.clone() })
    }

    /// Path of the script file, extension included.
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Path of the data file number `file`, extension included.
    pub fn data_path(&self, file: usize) -> Option<&Path> {
        self.data.get(file).map(|d| d.path.as_path())
    }

    /// Number of data files.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Path of the output file, as configured.
    pub fn out_path(&self) -> &Path {
        &self.out
    }

    fn index(&self, file: i64) -> Result<usize, Error> {
        usize::try_from(file).ok()
            .filter(|&i| i < self.data.len())
            .ok_or(Error::IndexOutOfRange { index: file,
                                            len: self.data.len() })
    }

    fn dat_index(&self, idx: &str) -> Result<usize, Error> {
        let i: i64 = idx.parse().map_err(|source| {
            Error::DatIndex { index: idx.to_string(), source } })?;
        self.index(i)
    }

    /// Replace the placeholders of `cmd`.
    ///
    /// # Example
    ///
    /// ```
    /// use gnuplot_session::Options;
    /// let s = Options::new("target/resolve", "target/resolve.svg")
    ///     .data("target/resolve")
    ///     .create()?;
    /// assert_eq!(s.resolve("plot ${dat:0} u 1:2")?,
    ///            "plot 'target/resolve.dat' u 1:2");
    /// assert_eq!(s.resolve("set output ${out}")?,
    ///            "set output 'target/resolve.svg'");
    /// assert!(s.resolve("plot ${dat:1}").is_err());
    /// # Ok::<(), gnuplot_session::Error>(())
    /// ```
    pub fn resolve(&self, cmd: &str) -> Result<String, Error> {
        let mut resolved = String::with_capacity(cmd.len());
        let mut prev = 0;
        for m in OP.find_iter(cmd) {
            resolved.push_str(&cmd[prev .. m.start()]);
            let op = &cmd[m.start() + 2 .. m.end() - 1];
            match op.split_once(':') {
                Some(("dat", idx)) => {
                    let i = self.dat_index(idx)?;
                    resolved.push_str(&self.data[i].quoted)
                }
                None if op == "out" => resolved.push_str(&self.out_quoted),
                None if op == "dat" =>
                    return Err(Error::MalformedDatOp(op.to_string())),
                _ => return Err(Error::UnknownOp(op.to_string())),
            }
            prev = m.end();
        }
        resolved.push_str(&cmd[prev ..]);
        Ok(resolved)
    }

    /// Append `cmds` to the script, one per line, after replacing
    /// their placeholders (see [`Session::resolve`]).  If any of the
    /// commands fails to resolve, none of them is written.
    pub fn cmds<I>(&mut self, cmds: I) -> Result<(), Error>
    where I: IntoIterator,
          I::Item: AsRef<str> {
        let resolved = cmds.into_iter()
            .map(|c| self.resolve(c.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        for line in &resolved {
            self.script.write_all(line.as_bytes())?;
            self.script.write_all(b"\n")?;
        }
        trace!(lines = resolved.len(), "appended commands");
        Ok(())
    }

    /// Append a single command.  See [`Session::cmds`].
    pub fn cmd(&mut self, cmd: &str) -> Result<(), Error> {
        self.cmds([cmd])
    }

    /// Write a row to the data file number `file`.
    ///
    /// If `fields` is empty, nothing is done and no error is returned,
    /// whatever `file` is.  A single empty field writes a blank line,
    /// which gnuplot uses to separate data blocks.
    pub fn data_row<I>(&mut self, file: usize, fields: I) -> Result<(), Error>
    where I: IntoIterator,
          I::Item: AsRef<[u8]> {
        let fields: Vec<I::Item> = fields.into_iter().collect();
        if fields.is_empty() {
            return Ok(())
        }
        let i = self.index(i64::try_from(file).unwrap_or(i64::MAX))?;
        let dat = &mut self.data[i];
        match fields.as_slice() {
            [f] if f.as_ref().is_empty() => dat.blank_line(),
            _ => {
                dat.writer.write_record(&fields)?;
                dat.rows += 1;
                Ok(())
            }
        }
    }

    /// Write the points (`x[i]`, `y[i]`) to the data file number
    /// `file`, one per row.  Extra values of the longer slice are
    /// ignored.
    pub fn data_xy<X, Y>(&mut self, file: usize, x: &X, y: &Y)
                         -> Result<(), Error>
    where X: AsRef<[f64]> + ?Sized,
          Y: AsRef<[f64]> + ?Sized {
        for (x, y) in x.as_ref().iter().zip(y.as_ref()) {
            self.data_row(file, [x.to_string(), y.to_string()])?;
        }
        Ok(())
    }

    /// Write the values `y` to the data file number `file`, one per
    /// row.  Gnuplot uses the row number as abscissa.
    pub fn data_y<D>(&mut self, file: usize, y: &D) -> Result<(), Error>
    where D: AsRef<[f64]> + ?Sized {
        for y in y.as_ref() {
            self.data_row(file, [y.to_string()])?;
        }
        Ok(())
    }

    #[cfg(feature = "curve-sampling")]
    /// Sample the graph of `f` on the interval \[`a`, `b`\] with at most
    /// `n` evaluations and write it to the data file number `file`.
    /// Points where `f` is not finite become blank lines, so gnuplot
    /// breaks the curve there.  Panic if `n` < 2.
    pub fn data_fun<F>(&mut self, file: usize, f: F, a: f64, b: f64,
                       n: usize) -> Result<(), Error>
    where F: FnMut(f64) -> f64 {
        if n < 2 {
            panic!("gnuplot_session::Session::data_fun: at least two \
                    points are required.");
        }
        let s = Sampling::fun(f, a, b).n(n).build();
        for (x, y) in s.x().iter().zip(s.y().iter()) {
            if y.is_finite() {
                self.data_row(file, [x.to_string(), y.to_string()])?;
            } else {
                self.data_row(file, [""])?;
            }
        }
        Ok(())
    }

    /// Flush the script and all data files without closing them.
    pub fn flush(&mut self) -> Result<(), Error> {
        for dat in &mut self.data {
            dat.writer.flush()?;
        }
        self.script.flush()?;
        Ok(())
    }

    /// Flush and close all files, then run the renderer on the script
    /// (`gnuplot -c <script>`).  The renderer shares the standard
    /// output and error of the current process.  It is killed if
    /// `cancel` fires before it exits.
    pub fn run(self, cancel: &CancelToken) -> Result<(), Error> {
        let Session { script_path, mut script, data, program, .. } = self;
        for mut dat in data {
            dat.writer.flush()?;
            debug!(path = %dat.path.display(), rows = dat.rows,
                   "closed data file");
        }
        script.flush()?;
        drop(script);
        debug!(path = %script_path.display(), "closed script");

        if let Some(e) = cancel.reason() {
            return Err(e)
        }
        let mut child = Command::new(&program)
            .arg("-c")
            .arg(&script_path)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| Error::Spawn { program: program.clone(),
                                             source })?;
        debug!(program = ?program, pid = child.id(), "launched renderer");
        let status = loop {
            match child.wait_timeout(POLL) {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Some(e) = cancel.reason() {
                        let _ = child.kill();
                        let _ = child.wait();
                        debug!(program = ?program, "killed renderer");
                        return Err(e)
                    }
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Io(e))
                }
            }
        };
        debug!(program = ?program, %status, "renderer exited");
        if status.success() { Ok(()) } else { Err(Error::Exit(status)) }
    }
}
