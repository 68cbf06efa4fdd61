//! Small helpers shared by the workloads and the engine.

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;

/// Read an entire [`Bytes`] slice into a [`String`].
///
/// Returns an error if the slice contains invalid UTF-8.
pub fn string_from_bytes(buf: Bytes) -> Result<String> {
    Ok(String::from_utf8(buf.as_ref().into())?)
}

/// Convert a [`String`] to [`Bytes`].
#[inline]
pub fn string_to_bytes(s: String) -> Bytes {
    Bytes::from(s)
}

/// Serializes command-line style arguments into the auxiliary bytes handed
/// to every map and reduce call.
pub fn serialize_args<S: AsRef<str>>(args: &[S]) -> Result<Bytes> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    Ok(Bytes::from(serde_json::to_vec(&args)?))
}

/// Parses the auxiliary bytes of a task into the workload's argument struct.
///
/// Empty bytes are treated as an empty argument list.
pub fn parse_aux<A: Parser>(aux: &Bytes) -> Result<A> {
    let args: Vec<String> = if aux.is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice(aux)?
    };
    Ok(A::try_parse_from(args)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser, Debug)]
    #[clap(no_binary_name = true)]
    struct Args {
        #[clap(long)]
        term: String,
        #[clap(long)]
        verbose: bool,
    }

    #[test]
    fn aux_round_trips_through_json() {
        let aux = serialize_args(&["--term", "rain", "--verbose"]).unwrap();
        let args: Args = parse_aux(&aux).unwrap();
        assert_eq!(args.term, "rain");
        assert!(args.verbose);
    }

    #[test]
    fn missing_required_argument_is_an_error() {
        assert!(parse_aux::<Args>(&Bytes::new()).is_err());
        assert!(parse_aux::<Args>(&Bytes::from_static(b"not json")).is_err());
    }
}
