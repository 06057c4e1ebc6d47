//! Dependency graph construction and validation.
//!
//! Builds adjacency on both sides of the `needs` relation once, at load time.
//! The scheduler uses the dependent index and indegree counters for O(1)
//! readiness bookkeeping on each job completion.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use super::pipeline::Pipeline;

/// Errors detected while building the graph. All are fatal before a run starts.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("Dependency cycle involving job '{job_id}'")]
    CyclicDependency { job_id: String },

    #[error("Job '{job_id}' needs unknown job '{reference}'")]
    UnknownJobReference { job_id: String, reference: String },

    #[error("Job '{job_id}' lists '{reference}' in needs more than once")]
    DuplicateNeed { job_id: String, reference: String },
}

/// Validated dependency index over a pipeline's jobs.
#[derive(Debug, Clone)]
pub struct JobGraph {
    /// job id -> jobs it needs
    dependencies: HashMap<String, Vec<String>>,

    /// job id -> jobs that need it
    dependents: HashMap<String, Vec<String>>,
}

impl JobGraph {
    /// Build and validate the graph for a pipeline.
    pub fn build(pipeline: &Pipeline) -> Result<Self, GraphError> {
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        // Deterministic order keeps error messages and scheduling stable.
        for job_id in pipeline.job_ids() {
            dependencies.entry(job_id.to_string()).or_default();
            dependents.entry(job_id.to_string()).or_default();
        }

        for job_id in pipeline.job_ids() {
            let job = &pipeline.jobs[job_id];
            let mut seen: Vec<&str> = Vec::new();

            for need in &job.needs {
                if !pipeline.jobs.contains_key(need) {
                    return Err(GraphError::UnknownJobReference {
                        job_id: job_id.to_string(),
                        reference: need.clone(),
                    });
                }
                if seen.contains(&need.as_str()) {
                    return Err(GraphError::DuplicateNeed {
                        job_id: job_id.to_string(),
                        reference: need.clone(),
                    });
                }
                seen.push(need);

                dependencies
                    .get_mut(job_id)
                    .expect("all jobs pre-seeded")
                    .push(need.clone());
                dependents
                    .get_mut(need)
                    .expect("all jobs pre-seeded")
                    .push(job_id.to_string());
            }
        }

        let graph = Self {
            dependencies,
            dependents,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Kahn's algorithm: if a topological ordering covers every job, the
    /// graph is acyclic; any leftover job sits on a cycle.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut indegree: HashMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(id, needs)| (id.as_str(), needs.len()))
            .collect();

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dependent in &self.dependents[id] {
                let degree = indegree
                    .get_mut(dependent.as_str())
                    .expect("dependent is a known job");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited == self.dependencies.len() {
            return Ok(());
        }

        // Name one job stuck on the cycle, smallest id for determinism.
        let mut cyclic: Vec<&str> = indegree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id)
            .collect();
        cyclic.sort_unstable();

        Err(GraphError::CyclicDependency {
            job_id: cyclic
                .first()
                .expect("cycle check failed, so a job remains")
                .to_string(),
        })
    }

    /// Jobs the given job needs
    pub fn dependencies_of(&self, job_id: &str) -> &[String] {
        self.dependencies
            .get(job_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Jobs that need the given job
    pub fn dependents_of(&self, job_id: &str) -> &[String] {
        self.dependents
            .get(job_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Indegree (number of needs) per job, for seeding the scheduler
    pub fn indegrees(&self) -> HashMap<String, usize> {
        self.dependencies
            .iter()
            .map(|(id, needs)| (id.clone(), needs.len()))
            .collect()
    }

    /// Number of jobs in the graph
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}
