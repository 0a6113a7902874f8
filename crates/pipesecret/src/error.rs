use std::fmt;

/// Several independent failures reported together.
#[derive(Debug)]
pub struct JoinedError {
    errors: Vec<anyhow::Error>,
}

impl JoinedError {
    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for JoinedError {}

/// Combine the outcomes of sibling tasks, reporting only what failed.
///
/// No failures yields `Ok`, a single failure is returned as is, and two or
/// more come back as one [`JoinedError`] so none of them is lost.
pub fn join_results<I>(results: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = anyhow::Result<()>>,
{
    let mut errors: Vec<anyhow::Error> = results.into_iter().filter_map(Result::err).collect();
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(JoinedError { errors }.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn all_ok_joins_to_ok() {
        assert!(join_results([Ok(()), Ok(())]).is_ok());
    }

    #[test]
    fn single_failure_is_returned_unwrapped() {
        let err = join_results([Ok(()), Err(anyhow!("relay broke"))]).unwrap_err();
        assert!(err.downcast_ref::<JoinedError>().is_none());
        assert_eq!(err.to_string(), "relay broke");
    }

    #[test]
    fn both_failures_are_kept() {
        let err = join_results([
            Err(anyhow!("bridge broke")),
            Err(anyhow!("eof").context("relay broke")),
        ])
        .unwrap_err();
        let joined = err.downcast_ref::<JoinedError>().unwrap();
        assert_eq!(joined.errors().len(), 2);
        assert_eq!(err.to_string(), "bridge broke\nrelay broke: eof");
    }
}
