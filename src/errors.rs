/// Custom error type for the tephra2-batch crate.
///
/// Variants follow the failure taxonomy of the batch pipeline: configuration
/// errors surface before any simulation work, input validation errors before
/// any expensive setup, execution errors abort the whole batch, and data
/// errors abort aggregation.  No variant is retried anywhere.
#[derive(Debug)]
pub enum BatchError {
    /// A line in a parameter template matched neither grammar shape.
    Grammar {
        /// 1-based line number in the template file.
        line: usize,
        /// The offending line, verbatim.
        text: String,
    },
    /// The same parameter name was declared twice in one template.
    DuplicateParameter(String),
    /// A sampled parameter named a function absent from the registry.
    UnknownFunction {
        /// The unresolved function name.
        function: String,
        /// The parameter whose spec named it.
        parameter: String,
    },
    /// A sampling function was handed the wrong number of arguments.
    BadArity {
        /// The function name.
        function: String,
        /// Arguments the function requires.
        expected: usize,
        /// Arguments the template supplied.
        got: usize,
    },
    /// A back-reference named a parameter not declared earlier in the table.
    BadReference {
        /// The parameter carrying the reference.
        parameter: String,
        /// The referenced name.
        reference: String,
    },
    /// A phase-type template file was missing from the template directory.
    MissingTemplate(String),
    /// An input file or path failed eager validation.
    Validation(String),
    /// The multiphase timeline file was malformed.
    Timeline(String),
    /// No wind data was available for a requested date.
    MissingWind(String),
    /// The external simulator exited with a non-zero status.
    Simulator {
        /// The failing command line, verbatim, for manual reproduction.
        command: String,
        /// Exit code, if the process was not killed by a signal.
        status: Option<i32>,
    },
    /// A simulator output cell failed numeric coercion.
    Data {
        /// 1-based data row.
        row: usize,
        /// Column name.
        column: String,
        /// The cell contents that would not coerce.
        value: String,
    },
    /// A statistical distribution could not be built from its parameters.
    Distribution(String),
    /// Error type from the csv crate.
    CsvError(String),
    /// Error type from std::io.
    IoError(String),
    /// Error type from chrono date parsing.
    DateError(String),
    /// Error type from bincode archive (de)serialization.
    ArchiveError(String),
}

impl std::error::Error for BatchError {}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BatchError::Grammar { line, text } => {
                write!(f, "Malformed config directive on line {}: \"{}\"", line, text)
            }
            BatchError::DuplicateParameter(name) => {
                write!(f, "Parameter {} declared more than once.", name)
            }
            BatchError::UnknownFunction { function, parameter } => write!(
                f,
                "Unknown sample function \"{}\" in config for parameter {}.",
                function, parameter
            ),
            BatchError::BadArity {
                function,
                expected,
                got,
            } => write!(
                f,
                "Sample function \"{}\" takes {} arguments, config supplied {}.",
                function, expected, got
            ),
            BatchError::BadReference { parameter, reference } => write!(
                f,
                "Parameter {} references |{}|, which is not declared earlier in the table.",
                parameter, reference
            ),
            BatchError::MissingTemplate(path) => {
                write!(f, "Phase configuration template file '{}' not found.", path)
            }
            BatchError::Validation(msg) => write!(f, "{}", msg),
            BatchError::Timeline(msg) => write!(f, "Malformed multiphase timeline: {}", msg),
            BatchError::MissingWind(date) => {
                write!(f, "No wind data available for date {}.", date)
            }
            BatchError::Simulator { command, status } => match status {
                Some(code) => write!(
                    f,
                    "Simulator failed with error code {}. Failed command: {}",
                    code, command
                ),
                None => write!(
                    f,
                    "Simulator terminated by signal. Failed command: {}",
                    command
                ),
            },
            BatchError::Data { row, column, value } => write!(
                f,
                "Non-numeric cell \"{}\" in simulator output (row {}, column {}).",
                value, row, column
            ),
            BatchError::Distribution(msg) => {
                write!(f, "Could not construct sampling distribution: {}", msg)
            }
            BatchError::CsvError(msg) => {
                write!(f, "Could not serialize/deserialize csv file: {}", msg)
            }
            BatchError::IoError(msg) => write!(f, "Could not read file from path provided: {}", msg),
            BatchError::DateError(msg) => write!(f, "Could not parse date: {}", msg),
            BatchError::ArchiveError(msg) => {
                write!(f, "Could not read/write phase archive: {}", msg)
            }
        }
    }
}

impl From<csv::Error> for BatchError {
    fn from(err: csv::Error) -> Self {
        BatchError::CsvError(err.to_string())
    }
}

impl From<std::io::Error> for BatchError {
    fn from(err: std::io::Error) -> Self {
        BatchError::IoError(err.to_string())
    }
}

impl From<chrono::ParseError> for BatchError {
    fn from(err: chrono::ParseError) -> Self {
        BatchError::DateError(err.to_string())
    }
}

impl From<bincode::Error> for BatchError {
    fn from(err: bincode::Error) -> Self {
        BatchError::ArchiveError(err.to_string())
    }
}

impl From<rand_distr::NormalError> for BatchError {
    fn from(err: rand_distr::NormalError) -> Self {
        BatchError::Distribution(err.to_string())
    }
}

impl From<rand_distr::ExpError> for BatchError {
    fn from(err: rand_distr::ExpError) -> Self {
        BatchError::Distribution(err.to_string())
    }
}
